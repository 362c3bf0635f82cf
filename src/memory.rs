//! In-process lease store for single-process use and contract testing

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::lease::{Clock, LeaseRecord, SystemClock};
use crate::store::LeaseStore;

/// Manually-advanced clock for exercising expiry without real time passing
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at the current wall time
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Create a clock frozen at the given instant
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock lock poisoned");
        *now += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock poisoned")
    }
}

/// Lease store backed by process memory
///
/// A single monitor guards the record map, which makes every check-then-act
/// trivially atomic — this is the reference conformance implementation of the
/// [`LeaseStore`] contract and the store of choice for tests and for guarding
/// singleton work inside one process. Expiry is evaluated against an
/// injectable [`Clock`], so contract tests never have to sleep.
///
/// Multiple engines sharing one instance (via `Arc`) behave as independent
/// competitors, which is exactly how the cross-engine tests use it.
pub struct InMemoryLeaseStore {
    leases: Mutex<HashMap<String, LeaseRecord>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryLeaseStore {
    /// Create a store using the system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store with an injected time source
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Number of live (unexpired) leases held
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.leases
            .lock()
            .expect("lease map lock poisoned")
            .values()
            .filter(|record| record.is_valid_at(now))
            .count()
    }

    /// Whether no live lease exists
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryLeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn try_acquire(
        &self,
        election_name: &str,
        participant_id: &str,
        lease_duration: Duration,
        metadata: Option<&HashMap<String, String>>,
    ) -> Result<Option<LeaseRecord>> {
        let now = self.clock.now();
        let mut leases = self.leases.lock().expect("lease map lock poisoned");

        if let Some(existing) = leases.get(election_name) {
            if existing.is_valid_at(now) {
                return Ok(None);
            }
        }

        let record = LeaseRecord::new(participant_id, lease_duration, metadata.cloned(), now);
        leases.insert(election_name.to_string(), record.clone());
        Ok(Some(record))
    }

    async fn try_renew(
        &self,
        election_name: &str,
        participant_id: &str,
        lease_duration: Duration,
        metadata: Option<&HashMap<String, String>>,
    ) -> Result<Option<LeaseRecord>> {
        let now = self.clock.now();
        let mut leases = self.leases.lock().expect("lease map lock poisoned");

        match leases.get(election_name) {
            Some(existing) if existing.participant_id == participant_id => {
                let record =
                    LeaseRecord::new(participant_id, lease_duration, metadata.cloned(), now);
                leases.insert(election_name.to_string(), record.clone());
                Ok(Some(record))
            }
            _ => Ok(None),
        }
    }

    async fn release(&self, election_name: &str, participant_id: &str) -> Result<bool> {
        let mut leases = self.leases.lock().expect("lease map lock poisoned");

        match leases.get(election_name) {
            Some(existing) if existing.participant_id == participant_id => {
                leases.remove(election_name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_current(&self, election_name: &str) -> Result<Option<LeaseRecord>> {
        let now = self.clock.now();
        let mut leases = self.leases.lock().expect("lease map lock poisoned");

        match leases.get(election_name) {
            Some(existing) if existing.is_valid_at(now) => Ok(Some(existing.clone())),
            Some(_) => {
                // Expired records are cleaned up on read.
                leases.remove(election_name);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn has_valid(&self, election_name: &str) -> Result<bool> {
        // Override the default so validity uses this store's clock.
        Ok(self.get_current(election_name).await?.is_some())
    }
}
