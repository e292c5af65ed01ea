//! WorkerBuilder - wiring for an `OutboxWorker`.
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 開発体験の改善（明確なエラーメッセージ）

use std::sync::Arc;

use super::config::WorkerConfig;
use super::worker::OutboxWorker;
use crate::domain::{JobType, OutboxError};
use crate::ports::{Clock, Coordinator, IdGenerator, JobStore, SystemClock, UlidGenerator};
use crate::typed::{Handler, HandlerRegistry, JobHandler, JobPayload, RegistryError};

/// # 使用例
/// ```ignore
/// let worker = WorkerBuilder::new(config)
///     .store(store)
///     .coordinator(coordinator)
///     .register::<SyncContact, _>(SyncContactHandler)?
///     .expect_job_types(&["crm.sync_contact"])
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - `expect_job_types()` で期待される job_type を宣言
/// - `build()` 時に「期待集合 ⊆ 登録済み集合」をチェック
/// - 不足があれば `BuildError::MissingJobTypes` を返す
pub struct WorkerBuilder {
    config: WorkerConfig,
    store: Option<Arc<dyn JobStore>>,
    coordinator: Option<Arc<dyn Coordinator>>,
    clock: Arc<dyn Clock>,
    registry: HandlerRegistry,
    expected: Option<Vec<JobType>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing job types: {0:?}. These job types were expected but have no handler.")]
    MissingJobTypes(Vec<String>),

    #[error("no job store configured")]
    MissingStore,

    #[error("no coordinator configured")]
    MissingCoordinator,

    #[error("invalid worker config: {0}")]
    InvalidConfig(#[source] OutboxError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl WorkerBuilder {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            store: None,
            coordinator: None,
            clock: Arc::new(SystemClock),
            registry: HandlerRegistry::new(),
            expected: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn coordinator(mut self, coordinator: Arc<dyn Coordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn register<T: JobPayload, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<T, H>(handler)?;
        Ok(self)
    }

    pub fn register_dyn(
        mut self,
        job_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Result<Self, RegistryError> {
        self.registry
            .register_dyn(JobType::new(job_type), handler)?;
        Ok(self)
    }

    /// Replace the registry wholesale (e.g. one shared by several workers).
    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn expect_job_types(mut self, job_types: &[&str]) -> Self {
        self.expected = Some(job_types.iter().map(|t| JobType::new(*t)).collect());
        self
    }

    /// # 検証
    /// - config の値
    /// - store / coordinator の有無
    /// - `expect_job_types()` の全 job_type に handler があること
    pub fn build(self) -> Result<OutboxWorker, BuildError> {
        self.config.validate().map_err(BuildError::InvalidConfig)?;
        let store = self.store.ok_or(BuildError::MissingStore)?;
        let coordinator = self.coordinator.ok_or(BuildError::MissingCoordinator)?;

        if let Some(expected) = &self.expected {
            let missing: Vec<String> = expected
                .iter()
                .filter(|t| !self.registry.contains(t))
                .map(|t| t.as_str().to_string())
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingJobTypes(missing));
            }
        }

        let instance_id = match &self.config.instance_id {
            Some(id) => id.clone(),
            None => {
                let ids = UlidGenerator::new(Arc::clone(&self.clock));
                format!("worker-{}", ids.generate_job_id().as_ulid())
            }
        };

        Ok(OutboxWorker::new(
            self.config,
            instance_id,
            store,
            coordinator,
            Arc::new(self.registry),
            self.clock,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{InMemoryCoordinator, InMemoryJobStore};
    use crate::typed::handler::fixtures::{ContactHandler, CountingEmailHandler};
    use crate::typed::payload::fixtures::{SendEmail, SyncContact};

    fn builder() -> WorkerBuilder {
        WorkerBuilder::new(WorkerConfig::default())
            .store(Arc::new(InMemoryJobStore::new()))
            .coordinator(Arc::new(InMemoryCoordinator::new()))
    }

    #[test]
    fn build_success() {
        let worker = builder()
            .register::<SendEmail, _>(CountingEmailHandler::default())
            .unwrap()
            .expect_job_types(&[SendEmail::TYPE])
            .build()
            .unwrap();
        assert!(worker.instance_id().starts_with("worker-"));
    }

    #[test]
    fn build_missing_job_types() {
        let result = builder()
            .register::<SendEmail, _>(CountingEmailHandler::default())
            .unwrap()
            .expect_job_types(&[SendEmail::TYPE, SyncContact::TYPE])
            .build();
        assert!(matches!(
            result,
            Err(BuildError::MissingJobTypes(missing)) if missing == vec![SyncContact::TYPE.to_string()]
        ));
    }

    #[test]
    fn build_without_expectations() {
        let result = builder().register::<SyncContact, _>(ContactHandler).unwrap().build();
        assert!(result.is_ok());
    }

    #[test]
    fn build_requires_store_and_coordinator() {
        let result = WorkerBuilder::new(WorkerConfig::default()).build();
        assert!(matches!(result, Err(BuildError::MissingStore)));

        let result = WorkerBuilder::new(WorkerConfig::default())
            .store(Arc::new(InMemoryJobStore::new()))
            .build();
        assert!(matches!(result, Err(BuildError::MissingCoordinator)));
    }

    #[test]
    fn build_rejects_invalid_config() {
        let config = WorkerConfig {
            batch_size: 0,
            ..WorkerConfig::default()
        };
        let result = WorkerBuilder::new(config)
            .store(Arc::new(InMemoryJobStore::new()))
            .coordinator(Arc::new(InMemoryCoordinator::new()))
            .build();
        assert!(matches!(result, Err(BuildError::InvalidConfig(_))));
    }

    #[test]
    fn configured_instance_id_is_kept() {
        let config = WorkerConfig {
            instance_id: Some("worker-a".into()),
            ..WorkerConfig::default()
        };
        let worker = WorkerBuilder::new(config)
            .store(Arc::new(InMemoryJobStore::new()))
            .coordinator(Arc::new(InMemoryCoordinator::new()))
            .build()
            .unwrap();
        assert_eq!(worker.instance_id(), "worker-a");
    }
}
