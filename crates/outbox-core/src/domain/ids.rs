//! Domain identifiers (strongly-typed IDs).
//!
//! Every persisted record is keyed by a ULID wrapped in `Id<T>`, where `T` is
//! a zero-sized marker. ULIDs sort by creation time, so jobs enqueued at the
//! same `next_run_at` still come out of `claim_batch` in a stable order.
//!
//! `JobId` and `DeadLetterId` are distinct types; mixing them up is a compile
//! error.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// Marker trait for each id kind. Provides the `Display` prefix.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ULID-backed id.
///
/// # Example
/// ```ignore
/// let job_id: JobId = Id::from(Ulid::new());
/// let dl_id: DeadLetterId = Id::from(Ulid::new());
/// // job_id == dl_id  <- does not compile
/// ```
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }

    /// Storage form: the bare 26-char ULID, without the display prefix.
    pub fn to_storage(&self) -> String {
        self.ulid.to_string()
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Accepts both the prefixed display form and the bare storage form.
impl<T: IdMarker> FromStr for Id<T> {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw).map(Self::from_ulid)
    }
}

// ========================================
// Markers
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Job {}

impl IdMarker for Job {
    fn prefix() -> &'static str {
        "job-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeadLetter {}

impl IdMarker for DeadLetter {
    fn prefix() -> &'static str {
        "dlq-"
    }
}

/// Identifier of a queued job row.
pub type JobId = Id<Job>;

/// Identifier of a dead letter record.
pub type DeadLetterId = Id<DeadLetter>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_kind_prefix() {
        let job = JobId::from_ulid(Ulid::new());
        let dl = DeadLetterId::from_ulid(Ulid::new());

        assert!(job.to_string().starts_with("job-"));
        assert!(dl.to_string().starts_with("dlq-"));
    }

    #[test]
    fn parses_display_and_storage_forms() {
        let job = JobId::from_ulid(Ulid::new());

        let from_display: JobId = job.to_string().parse().unwrap();
        let from_storage: JobId = job.to_storage().parse().unwrap();

        assert_eq!(from_display, job);
        assert_eq!(from_storage, job);
        assert!("job-not-a-ulid".parse::<JobId>().is_err());
    }

    #[test]
    fn ulid_ids_are_sortable() {
        let id1 = JobId::from_ulid(Ulid::new());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = JobId::from_ulid(Ulid::new());

        assert!(id1 < id2);
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        use std::mem::size_of;

        assert_eq!(size_of::<JobId>(), size_of::<Ulid>());
        assert_eq!(size_of::<DeadLetterId>(), 16);
    }
}
