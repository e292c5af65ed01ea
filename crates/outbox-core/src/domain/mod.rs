//! Domain model (ids, jobs, dead letters, heartbeats, outcomes, errors).

pub mod dead_letter;
pub mod errors;
pub mod heartbeat;
pub mod ids;
pub mod job;
pub mod outcome;

pub use self::dead_letter::{DeadLetter, DeadLetterSnapshot};
pub use self::errors::{OutboxError, StoreError};
pub use self::heartbeat::{HeartbeatDetails, WorkerHeartbeat};
pub use self::ids::{DeadLetterId, JobId};
pub use self::job::{
    DEFAULT_MAX_ATTEMPTS, Job, JobCounts, JobStatus, JobType, NewJob, RECLAIM_ERROR, Reclaimed,
    TenantId,
};
pub use self::outcome::HandlerOutcome;
