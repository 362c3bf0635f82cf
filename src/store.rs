//! The portable lease-store contract every backend must satisfy

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::lease::LeaseRecord;

/// Atomic lease operations against one named election
///
/// A conforming implementation must make each operation atomic with respect to
/// its guard condition — "does a valid record already exist" for acquire,
/// "does the stored holder match mine" for renew and release — using whatever
/// primitive the backend offers (conditional writes, server-side scripting,
/// transactions, or a plain in-process monitor). That atomicity is the entire
/// mutual-exclusion argument: concurrent acquires for one name from
/// unsynchronized processes must yield exactly one success.
///
/// Contention is a normal outcome, never an error: a failed acquire or renew
/// returns `Ok(None)`, a failed release returns `Ok(false)`. Errors are
/// reserved for genuine backend failures (timeouts, connectivity, corrupt
/// payloads).
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Acquire the lease if no valid record exists for `election_name`
    ///
    /// On success writes a record with `acquired_at = now` and
    /// `expires_at = now + lease_duration` and returns it. If a valid record
    /// already exists it is left untouched and `Ok(None)` is returned. An
    /// expired record counts as absent and may be replaced.
    async fn try_acquire(
        &self,
        election_name: &str,
        participant_id: &str,
        lease_duration: Duration,
        metadata: Option<&HashMap<String, String>>,
    ) -> Result<Option<LeaseRecord>>;

    /// Renew the lease if `participant_id` is the stored holder
    ///
    /// On success the record is overwritten with a fresh
    /// `acquired_at`/`expires_at` pair covering a full `lease_duration` from
    /// now — a late renewal does not inherit banked time from the previous
    /// period. Fails without modification when the holder differs or no
    /// record exists.
    async fn try_renew(
        &self,
        election_name: &str,
        participant_id: &str,
        lease_duration: Duration,
        metadata: Option<&HashMap<String, String>>,
    ) -> Result<Option<LeaseRecord>>;

    /// Delete the lease if `participant_id` is the stored holder
    ///
    /// Returns `Ok(true)` only when a record belonging to `participant_id`
    /// was removed. A missing or foreign record is left untouched and yields
    /// `Ok(false)` — never an error.
    async fn release(&self, election_name: &str, participant_id: &str) -> Result<bool>;

    /// Current lease record, treating an expired record as absent
    ///
    /// Backends without native TTL (or with a stale write surviving a crash)
    /// must perform a read-time validity check and report an expired record
    /// as `Ok(None)` rather than returning it; they may also clean it up.
    async fn get_current(&self, election_name: &str) -> Result<Option<LeaseRecord>>;

    /// Whether a currently-valid lease exists for `election_name`
    async fn has_valid(&self, election_name: &str) -> Result<bool> {
        Ok(self
            .get_current(election_name)
            .await?
            .is_some_and(|record| record.is_valid()))
    }
}
