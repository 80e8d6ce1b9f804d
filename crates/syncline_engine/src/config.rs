//! Configuration for the sync engine.

use std::time::Duration;

/// Configuration for the sync worker and its supervisor.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How long the worker may stay idle before it asks the remote
    /// authority for server-side changes.
    pub poll_interval: Duration,
    /// Timeout for one network exchange.
    pub dispatch_timeout: Duration,
    /// Upper bound for the adaptive batch size, if any.
    pub max_batch_size: Option<usize>,
    /// Backoff between cycles after a transport failure.
    pub retry: RetryConfig,
    /// Backoff between worker restarts after a fault.
    pub restart: RetryConfig,
    /// A worker that stayed up this long resets the restart backoff.
    pub restart_reset_after: Duration,
    /// Faults a notification may cause before it is dropped.
    pub max_item_faults: u32,
    /// Name given to the worker thread.
    pub thread_name: String,
}

impl SyncConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_secs(300),
            dispatch_timeout: Duration::from_secs(30),
            max_batch_size: None,
            retry: RetryConfig::default(),
            restart: RetryConfig::new()
                .with_initial_delay(Duration::from_millis(250))
                .with_max_delay(Duration::from_secs(60)),
            restart_reset_after: Duration::from_secs(60),
            max_item_faults: 3,
            thread_name: "syncline-worker".into(),
        }
    }

    /// Sets the background poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the dispatch timeout.
    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = timeout;
        self
    }

    /// Caps the adaptive batch size.
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = Some(size.max(1));
        self
    }

    /// Sets the transport retry backoff.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the worker restart backoff.
    pub fn with_restart(mut self, restart: RetryConfig) -> Self {
        self.restart = restart;
        self
    }

    /// Sets how long a worker must survive to reset the restart backoff.
    pub fn with_restart_reset_after(mut self, window: Duration) -> Self {
        self.restart_reset_after = window;
        self
    }

    /// Sets how many worker faults a notification may cause before it is
    /// dropped.
    pub fn with_max_item_faults(mut self, faults: u32) -> Self {
        self.max_item_faults = faults.max(1);
        self
    }

    /// Sets the worker thread name.
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponential backoff settings.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry.
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
    pub fn new() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration that retries immediately.
    pub fn immediate() -> Self {
        Self {
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

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Calculates the delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Add up to 25% jitter
            let jitter = delay_secs * 0.25 * rand_jitter();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Cheap pseudo-random jitter in `[0, 1)` from the clock's sub-second nanos.
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}
