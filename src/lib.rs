//! Lease-based distributed leadership election
//!
//! Multiple process instances competing for a named role agree, at any
//! instant, on at most one leader by arbitrating through a shared store.
//! Use it to guard singleton work — a scheduled job, a cache warmer, a
//! cleanup sweep — against running concurrently on every replica of a
//! horizontally-scaled service.
//!
//! ## How it works
//!
//! - **Leases, not locks**: leadership is a time-bounded claim that expires
//!   unless renewed, so a crashed leader frees the role after at most one
//!   lease duration.
//! - **The store is the arbiter**: every backend implements a small set of
//!   atomic operations ([`LeaseStore`]) — acquire-if-absent, renew-if-mine,
//!   release-if-mine — and that atomicity is the whole mutual-exclusion
//!   argument. No consensus protocol, no quorum.
//! - **One loop per participant**: an [`ElectionEngine`] retries acquisition
//!   at one cadence while seeking and renews at another while leading,
//!   emitting a [`LeadershipChange`] exactly once per transition.
//!
//! Backends: Redis ([`RedisLeaseStore`], native TTL + scripted
//! check-and-act), SQLite ([`SqliteLeaseStore`], guarded single-statement
//! writes), and in-process memory ([`InMemoryLeaseStore`], for tests and
//! single-process use).
//!
//! ## Basic Usage
//!
//! ```rust
//! use leasehold::{ElectionEngine, ElectionOptions, InMemoryLeaseStore};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> leasehold::Result<()> {
//! let store = Arc::new(InMemoryLeaseStore::new());
//! let options = ElectionOptions::new().with_lease_duration(Duration::from_secs(15));
//!
//! let engine = ElectionEngine::new(store, "nightly-report", options)?;
//! engine.on_leadership_changed(|change| {
//!     if change.leadership_gained() {
//!         println!("this replica runs the report");
//!     }
//! });
//!
//! if engine.start().await {
//!     // leader-only work
//! }
//! engine.stop().await;
//! # Ok(())
//! # }
//! ```

mod engine;
mod error;
mod lease;
mod memory;
mod options;
mod redis;
mod sqlite;
mod store;

pub use engine::{ElectionEngine, ElectionState};
pub use error::{ElectionError, Result};
pub use lease::{Clock, LeadershipChange, LeaseRecord, SystemClock};
pub use memory::{InMemoryLeaseStore, ManualClock};
pub use options::{ElectionOptions, DEFAULT_LEASE_DURATION, MIN_LEASE_DURATION};
pub use sqlite::{SqliteLeaseStore, SqliteStoreOptions, DEFAULT_TABLE_NAME};
pub use store::LeaseStore;

pub use self::redis::{RedisLeaseStore, RedisStoreOptions, DEFAULT_KEY_PREFIX};
