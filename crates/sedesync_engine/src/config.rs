//! Configuration for sync runs and the scheduler.

use rand::Rng;
use std::time::Duration;

/// Default interval between incremental runs.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default lease expiry.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(15 * 60);

/// Default age after which SYNCED records are deleted.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Default interval between cleanup jobs.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum records per pull page.
    pub pull_batch_size: u32,
    /// Maximum records per push batch.
    pub push_batch_size: u32,
    /// Retry configuration for transport calls.
    pub retry: RetryConfig,
    /// Per-request timeout handed to the transport.
    pub timeout: Duration,
    /// How long a run lease lives without renewal.
    pub lease_ttl: Duration,
    /// What a full sync may do to local rows.
    pub full_sync: FullSyncPolicy,
}

impl SyncConfig {
    /// Creates a configuration with the default limits.
    pub fn new() -> Self {
        Self {
            pull_batch_size: 100,
            push_batch_size: 100,
            retry: RetryConfig::default(),
            timeout: Duration::from_secs(30),
            lease_ttl: DEFAULT_LEASE_TTL,
            full_sync: FullSyncPolicy::default(),
        }
    }

    /// Sets the pull batch size.
    pub fn with_pull_batch_size(mut self, size: u32) -> Self {
        self.pull_batch_size = size.max(1);
        self
    }

    /// Sets the push batch size.
    pub fn with_push_batch_size(mut self, size: u32) -> Self {
        self.push_batch_size = size.max(1);
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the lease expiry.
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Sets the full-sync policy.
    pub fn with_full_sync(mut self, policy: FullSyncPolicy) -> Self {
        self.full_sync = policy;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// What a full sync may do with local rows missing from the snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FullSyncPolicy {
    /// Tombstone local rows absent from the canonical snapshot.
    pub remove_missing: bool,
}

impl FullSyncPolicy {
    /// Policy that tombstones rows absent remotely.
    pub fn removing_missing() -> Self {
        Self {
            remove_missing: true,
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first included.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Disables jitter.
    pub fn without_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// Calculates the delay before a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter && delay_secs > 0.0 {
            // up to 25%
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen_range(0.0..1.0);
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Configuration for the periodic runner.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between incremental runs per site.
    pub interval: Duration,
    /// Age after which SYNCED records are deleted.
    pub retention: Duration,
    /// Interval between cleanup jobs.
    pub cleanup_interval: Duration,
}

impl SchedulerConfig {
    /// Creates a configuration with the default intervals.
    pub fn new() -> Self {
        Self {
            interval: DEFAULT_SYNC_INTERVAL,
            retention: DEFAULT_RETENTION,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }

    /// Sets the sync interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the retention horizon.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Sets the cleanup interval.
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new()
    }
}
