//! Timing configuration shared by the engine and store operations

use std::collections::HashMap;
use std::time::Duration;

/// Default lease duration when none is configured (or the configured value is below the floor)
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(30);
/// Smallest lease duration accepted by [`ElectionOptions::validate`]
pub const MIN_LEASE_DURATION: Duration = Duration::from_secs(5);

/// Validated timing configuration for an election participant
///
/// The renewal cadence is deliberately asymmetric: renewing at roughly a third
/// of the lease duration tolerates a missed tick or two (GC pause, scheduler
/// jitter, network blip) without losing leadership, while retrying for the
/// lease at a sixth of the duration bounds failover latency without hammering
/// the store.
///
/// # Example
///
/// ```rust
/// use leasehold::ElectionOptions;
/// use std::time::Duration;
///
/// let options = ElectionOptions::new()
///     .with_lease_duration(Duration::from_secs(30))
///     .validate();
///
/// assert_eq!(options.renewal_interval, Duration::from_secs(10));
/// assert_eq!(options.retry_interval, Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionOptions {
    /// How long an acquired or renewed lease stays valid
    pub lease_duration: Duration,
    /// How often a leader renews its lease (default: lease_duration / 3)
    pub renewal_interval: Duration,
    /// How often a non-leader retries acquisition (default: lease_duration / 6)
    pub retry_interval: Duration,
    /// Upper bound on any single store call (default: lease_duration / 6)
    pub operation_timeout: Duration,
    /// Opaque metadata written into acquired leases
    pub metadata: Option<HashMap<String, String>>,
    /// Whether `start()` keeps a background acquire/renew loop running
    pub enable_continuous_check: bool,
}

impl Default for ElectionOptions {
    fn default() -> Self {
        Self {
            lease_duration: DEFAULT_LEASE_DURATION,
            renewal_interval: DEFAULT_LEASE_DURATION / 3,
            retry_interval: DEFAULT_LEASE_DURATION / 6,
            operation_timeout: DEFAULT_LEASE_DURATION / 6,
            metadata: None,
            enable_continuous_check: true,
        }
    }
}

impl ElectionOptions {
    /// Create options with all defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the lease duration
    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    /// Set the renewal interval
    pub fn with_renewal_interval(mut self, renewal_interval: Duration) -> Self {
        self.renewal_interval = renewal_interval;
        self
    }

    /// Set the retry interval
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Set the per-operation timeout
    pub fn with_operation_timeout(mut self, operation_timeout: Duration) -> Self {
        self.operation_timeout = operation_timeout;
        self
    }

    /// Attach metadata to acquired leases
    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Enable or disable the continuous background loop
    pub fn with_continuous_check(mut self, enabled: bool) -> Self {
        self.enable_continuous_check = enabled;
        self
    }

    /// Return a corrected copy; never fails
    ///
    /// Each field is checked independently. A lease duration below the floor
    /// resets to the full default (not merely clamped to the floor). The three
    /// dependent intervals reset to their documented ratios whenever they are
    /// zero or not strictly below the lease duration — and the ratio is taken
    /// from the *corrected* lease duration, so a caller who sets only
    /// `lease_duration` gets internally consistent derived defaults.
    ///
    /// Post-condition:
    /// `0 < operation_timeout, renewal_interval, retry_interval < lease_duration`.
    pub fn validate(&self) -> Self {
        let mut corrected = self.clone();

        if corrected.lease_duration < MIN_LEASE_DURATION {
            tracing::debug!(
                configured = ?corrected.lease_duration,
                floor = ?MIN_LEASE_DURATION,
                "lease_duration below floor, resetting to default"
            );
            corrected.lease_duration = DEFAULT_LEASE_DURATION;
        }

        let lease = corrected.lease_duration;
        corrected.renewal_interval =
            Self::correct_interval(corrected.renewal_interval, lease, lease / 3);
        corrected.retry_interval =
            Self::correct_interval(corrected.retry_interval, lease, lease / 6);
        corrected.operation_timeout =
            Self::correct_interval(corrected.operation_timeout, lease, lease / 6);

        corrected
    }

    fn correct_interval(configured: Duration, lease: Duration, default: Duration) -> Duration {
        if configured.is_zero() || configured >= lease {
            default
        } else {
            configured
        }
    }
}
