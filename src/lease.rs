//! Lease records, leadership-change events, and the time source they share

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Time source used for lease validity checks
///
/// The in-memory store takes a `Clock` so expiry can be exercised in tests
/// without real time passing. External backends evaluate expiry with real
/// time on the store side.
pub trait Clock: Send + Sync {
    /// Current instant according to this clock
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time via `Utc::now()`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// An immutable record of who holds a lease and when it expires
///
/// Created by a successful acquire or renew and read-only afterward; a renew
/// supersedes the record rather than mutating it. `expires_at` is absolute
/// and derived once at write time — it is never recomputed from a duration
/// when the record is read back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// Opaque identifier of the current holder
    pub participant_id: String,
    /// When the lease was (re)established
    pub acquired_at: DateTime<Utc>,
    /// Absolute expiry instant
    pub expires_at: DateTime<Utc>,
    /// Opaque passthrough, never interpreted by the engine or store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

impl LeaseRecord {
    /// Create a record held by `participant_id` starting at `now` for `lease_duration`
    pub fn new(
        participant_id: impl Into<String>,
        lease_duration: Duration,
        metadata: Option<HashMap<String, String>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            participant_id: participant_id.into(),
            acquired_at: now,
            expires_at: now
                + chrono::Duration::from_std(lease_duration)
                    .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1_000)),
            metadata,
        }
    }

    /// Whether the lease is still valid right now
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    /// Whether the lease is valid at the given instant
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Signed time remaining until expiry; negative once expired
    pub fn time_to_expiry(&self) -> chrono::Duration {
        self.time_to_expiry_at(Utc::now())
    }

    /// Signed time remaining until expiry at the given instant
    pub fn time_to_expiry_at(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.expires_at - now
    }
}

/// Payload delivered to leadership-change listeners
///
/// Emitted exactly once per actual transition (gain or loss) of the emitting
/// engine — never on a no-op re-confirmation of the same holder.
#[derive(Debug, Clone)]
pub struct LeadershipChange {
    /// Whether the engine was leader before the transition
    pub was_leader: bool,
    /// Whether the engine is leader after the transition
    pub is_leader: bool,
    /// Last known lease state before the transition
    pub previous: Option<LeaseRecord>,
    /// Lease state after the transition
    pub current: Option<LeaseRecord>,
}

impl LeadershipChange {
    /// This engine became leader (absent previous holder counts as a change)
    pub fn leadership_gained(&self) -> bool {
        self.is_leader && self.leader_changed()
    }

    /// This engine stopped being leader while a previous lease was known
    pub fn leadership_lost(&self) -> bool {
        !self.is_leader && self.previous.is_some()
    }

    /// The holding participant differs between previous and current
    pub fn leader_changed(&self) -> bool {
        match (&self.previous, &self.current) {
            (Some(prev), Some(cur)) => prev.participant_id != cur.participant_id,
            (None, None) => false,
            _ => true,
        }
    }
}
