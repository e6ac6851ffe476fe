use std::time::Duration;

use testbench_core::job::PollProfileKind;

/// How often a tracker polls and how long it waits overall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollProfile {
    pub poll_interval: Duration,
    pub max_wait: Duration,
}

impl PollProfile {
    /// Full test scripts: poll every 10 s, give up after 2 h.
    pub const LONG_RUNNING: Self = Self {
        poll_interval: Duration::from_secs(10),
        max_wait: Duration::from_secs(2 * 60 * 60),
    };

    /// Short actions: poll every 2 s, give up after 5 min.
    pub const SHORT: Self = Self {
        poll_interval: Duration::from_secs(2),
        max_wait: Duration::from_secs(5 * 60),
    };
}

/// The two timing profiles a [`JobTracker`](crate::tracker::JobTracker)
/// chooses between per job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerConfig {
    pub long_running: PollProfile,
    pub short: PollProfile,
}

impl TrackerConfig {
    pub fn profile(&self, kind: PollProfileKind) -> PollProfile {
        match kind {
            PollProfileKind::LongRunning => self.long_running,
            PollProfileKind::Short => self.short,
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            long_running: PollProfile::LONG_RUNNING,
            short: PollProfile::SHORT,
        }
    }
}

/// Error for an environment variable that is set but unusable.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got {value:?}")]
    Invalid {
        var: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Engine configuration loaded from environment variables.
///
/// All fields have defaults suitable for a local executor.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Executor base URL (default: `http://localhost:6109`).
    pub executor_url: String,
    /// Bound on each individual executor HTTP call (default: 30 s).
    pub request_timeout: Duration,
    pub tracker: TrackerConfig,
    /// Event bus buffer size (default: `256`).
    pub event_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            executor_url: "http://localhost:6109".into(),
            request_timeout: Duration::from_secs(30),
            tracker: TrackerConfig::default(),
            event_channel_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                         | Default                 |
    /// |---------------------------------|-------------------------|
    /// | `EXECUTOR_URL`                  | `http://localhost:6109` |
    /// | `EXECUTOR_REQUEST_TIMEOUT_SECS` | `30`                    |
    /// | `POLL_INTERVAL_SECS`            | `10`                    |
    /// | `POLL_MAX_WAIT_SECS`            | `7200`                  |
    /// | `SHORT_POLL_INTERVAL_SECS`      | `2`                     |
    /// | `SHORT_POLL_MAX_WAIT_SECS`      | `300`                   |
    /// | `EVENT_CHANNEL_CAPACITY`        | `256`                   |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reading values through
    /// `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let executor_url = lookup("EXECUTOR_URL")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.executor_url);

        let request_timeout = secs(
            &lookup,
            "EXECUTOR_REQUEST_TIMEOUT_SECS",
            defaults.request_timeout,
        )?;

        let long = PollProfile::LONG_RUNNING;
        let long_running = PollProfile {
            poll_interval: secs(&lookup, "POLL_INTERVAL_SECS", long.poll_interval)?,
            max_wait: secs(&lookup, "POLL_MAX_WAIT_SECS", long.max_wait)?,
        };
        let short = PollProfile {
            poll_interval: secs(
                &lookup,
                "SHORT_POLL_INTERVAL_SECS",
                PollProfile::SHORT.poll_interval,
            )?,
            max_wait: secs(&lookup, "SHORT_POLL_MAX_WAIT_SECS", PollProfile::SHORT.max_wait)?,
        };

        let event_channel_capacity = match lookup("EVENT_CHANNEL_CAPACITY") {
            None => defaults.event_channel_capacity,
            Some(raw) => parse_positive(&raw).ok_or(ConfigError::Invalid {
                var: "EVENT_CHANNEL_CAPACITY",
                value: raw,
                expected: "a positive integer",
            })? as usize,
        };

        Ok(Self {
            executor_url,
            request_timeout,
            tracker: TrackerConfig {
                long_running,
                short,
            },
            event_channel_capacity,
        })
    }
}

/// Whole seconds, strictly positive. A zero poll interval would spin.
fn secs(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match lookup(var) {
        None => Ok(default),
        Some(raw) => parse_positive(&raw)
            .map(Duration::from_secs)
            .ok_or(ConfigError::Invalid {
                var,
                value: raw,
                expected: "a positive number of seconds",
            }),
    }
}

fn parse_positive(raw: &str) -> Option<u64> {
    raw.trim().parse::<u64>().ok().filter(|n| *n > 0)
}
