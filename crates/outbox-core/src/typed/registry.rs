//! HandlerRegistry - job_type → handler mapping, fixed at startup.
//!
//! # 学習ポイント
//! - HashMap での型消去された trait object の管理
//! - Generic methods での登録と型安全性
//! - Arc による共有所有権

use std::collections::HashMap;
use std::sync::Arc;

use super::handler::{Handler, JobHandler, TypedHandler};
use super::payload::JobPayload;
use crate::domain::JobType;

/// # 使用例
/// ```ignore
/// let mut registry = HandlerRegistry::new();
/// registry.register::<SyncContact, _>(SyncContactHandler)?;
///
/// let handler = registry.get(&JobType::new("crm.sync_contact"));
/// ```
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("handler for job type '{0}' is already registered")]
    AlreadyRegistered(JobType),
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler under `T::TYPE`.
    pub fn register<T: JobPayload, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        self.register_dyn(T::job_type(), Arc::new(TypedHandler::<T, H>::new(handler)))
    }

    /// Register a raw handler under an explicit job type.
    pub fn register_dyn(
        &mut self,
        job_type: JobType,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), RegistryError> {
        if self.handlers.contains_key(&job_type) {
            return Err(RegistryError::AlreadyRegistered(job_type));
        }
        self.handlers.insert(job_type, handler);
        Ok(())
    }

    pub fn get(&self, job_type: &JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &JobType) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Registered job types, sorted.
    pub fn registered_types(&self) -> Vec<JobType> {
        let mut types: Vec<_> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::domain::{HandlerOutcome, Job, OutboxError};
    use crate::typed::handler::fixtures::{ContactHandler, CountingEmailHandler};
    use crate::typed::payload::fixtures::{SendEmail, SyncContact};

    struct Noop;

    #[async_trait]
    impl JobHandler for Noop {
        async fn handle(&self, _job: &Job) -> Result<HandlerOutcome, OutboxError> {
            Ok(HandlerOutcome::success())
        }
    }

    #[test]
    fn register_and_get() {
        let mut registry = HandlerRegistry::new();
        registry
            .register::<SendEmail, _>(CountingEmailHandler::default())
            .unwrap();

        assert!(registry.get(&SendEmail::job_type()).is_some());
        assert!(registry.get(&SyncContact::job_type()).is_none());
    }

    #[test]
    fn double_registration_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register::<SyncContact, _>(ContactHandler).unwrap();
        let result = registry.register_dyn(SyncContact::job_type(), Arc::new(Noop));
        assert!(matches!(result, Err(RegistryError::AlreadyRegistered(t)) if t == SyncContact::job_type()));
    }

    #[test]
    fn registered_types_are_sorted() {
        let mut registry = HandlerRegistry::new();
        registry
            .register::<SendEmail, _>(CountingEmailHandler::default())
            .unwrap();
        registry.register::<SyncContact, _>(ContactHandler).unwrap();
        registry
            .register_dyn(JobType::new("audit.write"), Arc::new(Noop))
            .unwrap();

        let types: Vec<_> = registry
            .registered_types()
            .iter()
            .map(|t| t.as_str().to_string())
            .collect();
        assert_eq!(types, vec!["audit.write", "crm.sync_contact", "notify.send_email"]);
        assert_eq!(registry.len(), 3);
    }
}
