mod bucket;

pub use bucket::*;

use serde::Serialize;
use std::time::Duration;

/// Result of consuming one unit of quota for a key
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaStatus {
    pub limit: u32,
    pub remaining: u32,
    pub limited: bool,
    #[serde(serialize_with = "serialize_secs")]
    pub retry_after: Duration,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

/// Shared request counters behind the THROTTLE action.
///
/// Implementations must make check-and-consume atomic per key; concurrent
/// evaluations for the same client share one budget.
pub trait QuotaTracker: Send + Sync {
    fn check(&self, key: &str, limit: u32, window: Duration) -> QuotaStatus;
    fn tracked_keys(&self) -> usize;
}
