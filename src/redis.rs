//! Lease store backed by a TTL-capable Redis server
//!
//! Acquisition is a single `SET .. NX PX` round trip, letting Redis expire
//! the key natively. Renew and release must check the stored holder before
//! acting, so each runs as a server-side Lua script — the check-and-act is
//! one indivisible round trip regardless of how many participants race.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;

use crate::error::Result;
use crate::lease::LeaseRecord;
use crate::store::LeaseStore;

/// Default prefix for lease keys
pub const DEFAULT_KEY_PREFIX: &str = "leasehold:lease:";

/// Renew-if-mine: decode the stored payload, compare the holder, overwrite
/// with a fresh payload and TTL. Returns the new payload or nil.
const RENEW_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return nil end
local ok, rec = pcall(cjson.decode, raw)
if not ok or rec.participant_id ~= ARGV[1] then return nil end
redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
return ARGV[2]
"#;

/// Release-if-mine: decode, compare the holder, delete. Returns 1 on removal.
const RELEASE_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 0 end
local ok, rec = pcall(cjson.decode, raw)
if not ok or rec.participant_id ~= ARGV[1] then return 0 end
redis.call('DEL', KEYS[1])
return 1
"#;

/// Configuration for [`RedisLeaseStore`]
///
/// Connection and command timeouts belong to the host's
/// [`ConnectionManager`] configuration; the store only shapes key names.
#[derive(Debug, Clone)]
pub struct RedisStoreOptions {
    /// Prefix prepended to every election name to form the Redis key
    pub key_prefix: String,
}

impl Default for RedisStoreOptions {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

impl RedisStoreOptions {
    /// Create options with the default key prefix
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the key prefix
    pub fn with_key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = key_prefix.into();
        self
    }
}

/// Lease store over a Redis connection supplied by the host application
///
/// The store holds a [`ConnectionManager`] (cheap to clone, reconnects
/// internally) and never owns the connection lifecycle — constructing one
/// from an address is the host's concern.
pub struct RedisLeaseStore {
    conn: ConnectionManager,
    options: RedisStoreOptions,
    renew_script: Script,
    release_script: Script,
}

impl RedisLeaseStore {
    /// Create a store with the default key prefix
    pub fn new(conn: ConnectionManager) -> Self {
        Self::with_options(conn, RedisStoreOptions::default())
    }

    /// Create a store with explicit options
    pub fn with_options(conn: ConnectionManager, options: RedisStoreOptions) -> Self {
        Self {
            conn,
            options,
            renew_script: Script::new(RENEW_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
        }
    }

    /// Redis key for an election name
    pub fn key_for(&self, election_name: &str) -> String {
        format!("{}{}", self.options.key_prefix, election_name)
    }

    fn ttl_millis(lease_duration: Duration) -> u64 {
        (lease_duration.as_millis() as u64).max(1)
    }
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    async fn try_acquire(
        &self,
        election_name: &str,
        participant_id: &str,
        lease_duration: Duration,
        metadata: Option<&HashMap<String, String>>,
    ) -> Result<Option<LeaseRecord>> {
        let record = LeaseRecord::new(
            participant_id,
            lease_duration,
            metadata.cloned(),
            chrono::Utc::now(),
        );
        let payload = serde_json::to_string(&record)?;
        let key = self.key_for(election_name);

        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(&payload)
            .arg("NX")
            .arg("PX")
            .arg(Self::ttl_millis(lease_duration))
            .query_async(&mut conn)
            .await?;

        // Nil reply means the key already existed; Redis's own TTL makes an
        // expired record count as absent.
        Ok(reply.map(|_| record))
    }

    async fn try_renew(
        &self,
        election_name: &str,
        participant_id: &str,
        lease_duration: Duration,
        metadata: Option<&HashMap<String, String>>,
    ) -> Result<Option<LeaseRecord>> {
        let record = LeaseRecord::new(
            participant_id,
            lease_duration,
            metadata.cloned(),
            chrono::Utc::now(),
        );
        let payload = serde_json::to_string(&record)?;
        let key = self.key_for(election_name);

        let mut conn = self.conn.clone();
        let reply: Option<String> = self
            .renew_script
            .key(&key)
            .arg(participant_id)
            .arg(&payload)
            .arg(Self::ttl_millis(lease_duration))
            .invoke_async(&mut conn)
            .await?;

        Ok(reply.map(|_| record))
    }

    async fn release(&self, election_name: &str, participant_id: &str) -> Result<bool> {
        let key = self.key_for(election_name);

        let mut conn = self.conn.clone();
        let removed: i64 = self
            .release_script
            .key(&key)
            .arg(participant_id)
            .invoke_async(&mut conn)
            .await?;

        Ok(removed == 1)
    }

    async fn get_current(&self, election_name: &str) -> Result<Option<LeaseRecord>> {
        let key = self.key_for(election_name);

        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET").arg(&key).query_async(&mut conn).await?;

        let Some(raw) = raw else {
            return Ok(None);
        };
        let record: LeaseRecord = serde_json::from_str(&raw)?;

        // The TTL normally removes expired keys; a record can outlive its
        // expiry only through persistence replaying a stale write, so
        // validity is still checked at read time.
        if record.is_valid() {
            Ok(Some(record))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_derivation_uses_prefix() {
        let options = RedisStoreOptions::new().with_key_prefix("myapp:elections:");
        assert_eq!(options.key_prefix, "myapp:elections:");

        let default = RedisStoreOptions::default();
        assert_eq!(default.key_prefix, DEFAULT_KEY_PREFIX);
    }

    #[test]
    fn test_ttl_millis_never_zero() {
        assert_eq!(RedisLeaseStore::ttl_millis(Duration::from_nanos(1)), 1);
        assert_eq!(
            RedisLeaseStore::ttl_millis(Duration::from_secs(30)),
            30_000
        );
    }

    // Live-server coverage; run with `cargo test -- --ignored` against a
    // local redis.
    mod live {
        use super::*;
        use crate::store::LeaseStore;

        async fn connect() -> RedisLeaseStore {
            let client = redis::Client::open("redis://127.0.0.1/").unwrap();
            let conn = client.get_connection_manager().await.unwrap();
            RedisLeaseStore::with_options(
                conn,
                RedisStoreOptions::new().with_key_prefix("leasehold:test:"),
            )
        }

        #[tokio::test]
        #[ignore = "requires a running redis server"]
        async fn test_acquire_renew_release_round_trip() {
            let store = connect().await;
            let name = format!("rt-{}", uuid::Uuid::new_v4());

            let acquired = store
                .try_acquire(&name, "p1", Duration::from_secs(5), None)
                .await
                .unwrap();
            assert!(acquired.is_some());

            let blocked = store
                .try_acquire(&name, "p2", Duration::from_secs(5), None)
                .await
                .unwrap();
            assert!(blocked.is_none());

            let foreign = store
                .try_renew(&name, "p2", Duration::from_secs(5), None)
                .await
                .unwrap();
            assert!(foreign.is_none());

            let renewed = store
                .try_renew(&name, "p1", Duration::from_secs(5), None)
                .await
                .unwrap();
            assert!(renewed.is_some());

            assert!(!store.release(&name, "p2").await.unwrap());
            assert!(store.release(&name, "p1").await.unwrap());
            assert!(store.get_current(&name).await.unwrap().is_none());
        }

        #[tokio::test]
        #[ignore = "requires a running redis server"]
        async fn test_native_ttl_expires_lease() {
            let store = connect().await;
            let name = format!("ttl-{}", uuid::Uuid::new_v4());

            store
                .try_acquire(&name, "p1", Duration::from_millis(100), None)
                .await
                .unwrap()
                .unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;

            assert!(store.get_current(&name).await.unwrap().is_none());
            let taken = store
                .try_acquire(&name, "p2", Duration::from_secs(5), None)
                .await
                .unwrap();
            assert!(taken.is_some());
            store.release(&name, "p2").await.unwrap();
        }
    }
}
