//! JobPayload trait - ties a job_type string to a payload type.
//!
//! # 学習ポイント
//! - Associated Constants (`const TYPE`)
//! - Trait bounds (Serialize + DeserializeOwned + Send + Sync + 'static)

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::{JobType, NewJob, OutboxError, TenantId};

/// A payload type with a fixed job_type.
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct SyncContact {
///     contact_id: String,
/// }
///
/// impl JobPayload for SyncContact {
///     const TYPE: &'static str = "crm.sync_contact";
/// }
/// ```
///
/// # Trait Bounds
/// - `Serialize`: written into the job row at enqueue time
/// - `DeserializeOwned`: decoded from the row at dispatch time
/// - `Send + Sync + 'static`: moved across tasks inside handlers
pub trait JobPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// # 命名規約
    /// - `{domain}.{action}`
    /// - 例: `crm.sync_contact`
    const TYPE: &'static str;

    fn job_type() -> JobType {
        JobType::new(Self::TYPE)
    }

    /// Producer-side shortcut: a `NewJob` of this type.
    fn to_new_job(&self, tenant_id: TenantId) -> Result<NewJob, OutboxError> {
        NewJob::new(tenant_id, Self::job_type(), self)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::collections::HashMap;

    use serde::{Deserialize, Serialize};

    use super::JobPayload;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct SendEmail {
        pub to: String,
        pub subject: String,
    }

    impl JobPayload for SendEmail {
        const TYPE: &'static str = "notify.send_email";
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct SyncContact {
        pub contact_id: String,
        #[serde(default)]
        pub fields: HashMap<String, String>,
    }

    impl JobPayload for SyncContact {
        const TYPE: &'static str = "crm.sync_contact";
    }
}
