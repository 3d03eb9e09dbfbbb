//! Configuration for the scheduler, the session adapter and the front end.
//!
//! Configuration is read from a YAML file (every field optional) and can be
//! overridden from the command line. Durations are written as seconds:
//!
//! ```yaml
//! socket_path: /run/activity-decoder.sock
//! scheduler:
//!   queue_size: 32
//!   workers_num: 4
//!   read_file_timeout: 45
//!   result_ttl: 900
//!   tasks_before_session_restart: 50
//! session:
//!   program: /opt/decoder/driver
//!   args: ["--headless"]
//!   display:
//!     program: Xvfb
//!     first_display: 99
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Smallest accepted per-task read timeout.
pub const MIN_READ_FILE_TIMEOUT: Duration = Duration::from_secs(1);

/// Largest accepted per-task read timeout.
pub const MAX_READ_FILE_TIMEOUT: Duration = Duration::from_secs(600);

/// Largest accepted `max_net_stabilization_delay`.
pub const MAX_NET_STABILIZATION_DELAY: Duration = Duration::from_secs(600);

/// Default path of the unix socket the server listens on.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/activity-decoder.sock";

/// Serde helpers encoding a `Duration` as (fractional) seconds.
pub mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Configuration of the scheduler core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of tasks waiting in the queue.
    pub queue_size: usize,
    /// Number of workers (and therefore sessions).
    pub workers_num: usize,
    /// Hard per-task timeout handed to the session.
    #[serde(with = "secs")]
    pub read_file_timeout: Duration,
    /// Ceiling for the per-task network stabilization delay; larger
    /// requested delays are clamped to it.
    #[serde(with = "secs")]
    pub max_net_stabilization_delay: Duration,
    /// Whether sessions run under an isolated virtual display.
    pub virtual_display: bool,
    /// How long an outcome remains retrievable after it is produced.
    #[serde(with = "secs")]
    pub result_ttl: Duration,
    /// Number of tasks a session processes before it is replaced.
    pub tasks_before_session_restart: u32,
    /// Interval of the background sweep removing expired outcomes.
    #[serde(with = "secs")]
    pub eviction_interval: Duration,
    /// How long shutdown waits for in-flight tasks before aborting them.
    #[serde(with = "secs")]
    pub shutdown_grace: Duration,
    /// Upper bound on a single session construction attempt.
    #[serde(with = "secs")]
    pub session_start_timeout: Duration,
    /// Upper bound on a single session teardown.
    #[serde(with = "secs")]
    pub session_teardown_timeout: Duration,
    /// First delay between failed session construction attempts.
    #[serde(with = "secs")]
    pub session_retry_initial: Duration,
    /// Ceiling for the construction retry delay.
    #[serde(with = "secs")]
    pub session_retry_max: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_size: 64,
            workers_num: 2,
            read_file_timeout: Duration::from_secs(30),
            max_net_stabilization_delay: Duration::from_secs(60),
            virtual_display: true,
            result_ttl: Duration::from_secs(600),
            tasks_before_session_restart: 100,
            eviction_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
            session_start_timeout: Duration::from_secs(60),
            session_teardown_timeout: Duration::from_secs(10),
            session_retry_initial: Duration::from_secs(1),
            session_retry_max: Duration::from_secs(30),
        }
    }
}

impl SchedulerConfig {
    /// Creates a configuration with the given pool size and defaults otherwise.
    pub fn new(workers_num: usize) -> Self {
        Self {
            workers_num,
            ..Default::default()
        }
    }

    /// Sets the queue capacity.
    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    /// Sets the number of workers.
    pub fn with_workers_num(mut self, workers_num: usize) -> Self {
        self.workers_num = workers_num;
        self
    }

    /// Sets the per-task read timeout.
    pub fn with_read_file_timeout(mut self, timeout: Duration) -> Self {
        self.read_file_timeout = timeout;
        self
    }

    /// Sets the ceiling for per-task network stabilization delays.
    pub fn with_max_net_stabilization_delay(mut self, delay: Duration) -> Self {
        self.max_net_stabilization_delay = delay;
        self
    }

    /// Clamps a requested network stabilization delay to the configured ceiling.
    pub fn clamp_net_stabilization_delay(&self, requested: Duration) -> Duration {
        requested.min(self.max_net_stabilization_delay)
    }

    /// Enables or disables the virtual display.
    pub fn with_virtual_display(mut self, enabled: bool) -> Self {
        self.virtual_display = enabled;
        self
    }

    /// Sets the outcome time-to-live.
    pub fn with_result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = ttl;
        self
    }

    /// Sets the session restart threshold.
    pub fn with_tasks_before_session_restart(mut self, tasks: u32) -> Self {
        self.tasks_before_session_restart = tasks;
        self
    }

    /// Sets the eviction sweep interval.
    pub fn with_eviction_interval(mut self, interval: Duration) -> Self {
        self.eviction_interval = interval;
        self
    }

    /// Sets the shutdown grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Sets the session construction timeout.
    pub fn with_session_start_timeout(mut self, timeout: Duration) -> Self {
        self.session_start_timeout = timeout;
        self
    }

    /// Sets the session teardown timeout.
    pub fn with_session_teardown_timeout(mut self, timeout: Duration) -> Self {
        self.session_teardown_timeout = timeout;
        self
    }

    /// Sets the construction retry backoff bounds.
    pub fn with_session_retry(mut self, initial: Duration, max: Duration) -> Self {
        self.session_retry_initial = initial;
        self.session_retry_max = max;
        self
    }

    /// Checks every field against its allowed range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_size == 0 {
            return Err(ConfigError::invalid("queue_size", "must be at least 1"));
        }
        if self.workers_num == 0 {
            return Err(ConfigError::invalid("workers_num", "must be at least 1"));
        }
        if self.tasks_before_session_restart == 0 {
            return Err(ConfigError::invalid(
                "tasks_before_session_restart",
                "must be at least 1",
            ));
        }
        if self.read_file_timeout < MIN_READ_FILE_TIMEOUT
            || self.read_file_timeout > MAX_READ_FILE_TIMEOUT
        {
            return Err(ConfigError::invalid(
                "read_file_timeout",
                format!(
                    "{:?} is outside [{:?}, {:?}]",
                    self.read_file_timeout, MIN_READ_FILE_TIMEOUT, MAX_READ_FILE_TIMEOUT
                ),
            ));
        }
        if self.max_net_stabilization_delay > MAX_NET_STABILIZATION_DELAY {
            return Err(ConfigError::invalid(
                "max_net_stabilization_delay",
                format!("must not exceed {:?}", MAX_NET_STABILIZATION_DELAY),
            ));
        }
        if self.eviction_interval.is_zero() {
            return Err(ConfigError::invalid("eviction_interval", "must be positive"));
        }
        if self.session_start_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "session_start_timeout",
                "must be positive",
            ));
        }
        if self.session_retry_initial.is_zero() {
            return Err(ConfigError::invalid(
                "session_retry_initial",
                "must be positive",
            ));
        }
        if self.session_retry_max < self.session_retry_initial {
            return Err(ConfigError::invalid(
                "session_retry_max",
                "must not be smaller than session_retry_initial",
            ));
        }
        Ok(())
    }
}

/// Virtual display launched next to each process session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Display server executable.
    pub program: String,
    /// Arguments appended after the `:N` display name.
    pub args: Vec<String>,
    /// Display number used by the first worker; worker `i` uses `first_display + i`.
    pub first_display: u32,
    /// Time given to the display server before the helper is started.
    #[serde(with = "secs")]
    pub startup_delay: Duration,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            program: "Xvfb".to_string(),
            args: vec![
                "-screen".to_string(),
                "0".to_string(),
                "1280x1024x24".to_string(),
                "-nolisten".to_string(),
                "tcp".to_string(),
            ],
            first_display: 99,
            startup_delay: Duration::from_millis(500),
        }
    }
}

/// Helper program driven by a process session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessSessionConfig {
    /// Helper executable speaking the line-delimited JSON protocol.
    pub program: String,
    /// Helper arguments.
    pub args: Vec<String>,
    /// Extra environment for the helper.
    pub env: BTreeMap<String, String>,
    /// Virtual display settings, used when the scheduler enables it.
    pub display: DisplayConfig,
}

impl Default for ProcessSessionConfig {
    fn default() -> Self {
        Self {
            program: "activity-decoder-driver".to_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
            display: DisplayConfig::default(),
        }
    }
}

impl ProcessSessionConfig {
    /// Creates a configuration for the given helper program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Sets the helper arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Adds an environment variable for the helper.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Top-level configuration of the `serve` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Unix socket the front end listens on.
    pub socket_path: PathBuf,
    /// Scheduler settings.
    pub scheduler: SchedulerConfig,
    /// Session adapter settings.
    pub session: ProcessSessionConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            scheduler: SchedulerConfig::default(),
            session: ProcessSessionConfig::default(),
        }
    }
}

impl AppConfig {
    /// Loads a configuration file. Validation is left to the caller so that
    /// command-line overrides can be applied first.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Parses a YAML document.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Validates the full configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler.validate()?;
        if self.session.program.trim().is_empty() {
            return Err(ConfigError::invalid("session.program", "must not be empty"));
        }
        if self.scheduler.virtual_display && self.session.display.program.trim().is_empty() {
            return Err(ConfigError::invalid(
                "session.display.program",
                "must not be empty when virtual_display is enabled",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_config_default_is_valid() {
        let config = SchedulerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue_size, 64);
        assert_eq!(config.workers_num, 2);
        assert!(config.virtual_display);
    }

    #[test]
    fn test_scheduler_config_builder() {
        let config = SchedulerConfig::new(3)
            .with_queue_size(5)
            .with_read_file_timeout(Duration::from_secs(10))
            .with_virtual_display(false)
            .with_result_ttl(Duration::from_secs(1))
            .with_tasks_before_session_restart(7)
            .with_shutdown_grace(Duration::from_secs(2))
            .with_session_retry(Duration::from_millis(10), Duration::from_millis(40));

        assert_eq!(config.workers_num, 3);
        assert_eq!(config.queue_size, 5);
        assert_eq!(config.read_file_timeout, Duration::from_secs(10));
        assert!(!config.virtual_display);
        assert_eq!(config.result_ttl, Duration::from_secs(1));
        assert_eq!(config.tasks_before_session_restart, 7);
        assert_eq!(config.shutdown_grace, Duration::from_secs(2));
        assert_eq!(config.session_retry_max, Duration::from_millis(40));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_scheduler_config_rejects_zero_sizes() {
        let err = SchedulerConfig::default().with_queue_size(0).validate();
        assert!(matches!(err, Err(ConfigError::Invalid { field: "queue_size", .. })));

        let err = SchedulerConfig::default().with_workers_num(0).validate();
        assert!(matches!(err, Err(ConfigError::Invalid { field: "workers_num", .. })));

        let err = SchedulerConfig::default()
            .with_tasks_before_session_restart(0)
            .validate();
        assert!(matches!(
            err,
            Err(ConfigError::Invalid {
                field: "tasks_before_session_restart",
                ..
            })
        ));
    }

    #[test]
    fn test_read_file_timeout_bounds() {
        let too_short = SchedulerConfig::default().with_read_file_timeout(Duration::from_millis(10));
        assert!(too_short.validate().is_err());

        let too_long = SchedulerConfig::default().with_read_file_timeout(Duration::from_secs(3600));
        assert!(too_long.validate().is_err());

        let edge = SchedulerConfig::default().with_read_file_timeout(MAX_READ_FILE_TIMEOUT);
        assert!(edge.validate().is_ok());
    }

    #[test]
    fn test_net_stabilization_delay_ceiling() {
        let config = SchedulerConfig::default()
            .with_max_net_stabilization_delay(Duration::from_secs(5));
        assert!(config.validate().is_ok());
        assert_eq!(
            config.clamp_net_stabilization_delay(Duration::from_secs(3600)),
            Duration::from_secs(5)
        );
        assert_eq!(
            config.clamp_net_stabilization_delay(Duration::from_secs(2)),
            Duration::from_secs(2)
        );

        let too_long = SchedulerConfig::default()
            .with_max_net_stabilization_delay(Duration::from_secs(3600));
        assert!(matches!(
            too_long.validate(),
            Err(ConfigError::Invalid {
                field: "max_net_stabilization_delay",
                ..
            })
        ));
    }

    #[test]
    fn test_retry_bounds_must_be_ordered() {
        let config = SchedulerConfig::default()
            .with_session_retry(Duration::from_secs(5), Duration::from_secs(1));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "session_retry_max",
                ..
            })
        ));
    }

    #[test]
    fn test_app_config_from_yaml() {
        let yaml = r#"
socket_path: /tmp/test.sock
scheduler:
  queue_size: 8
  workers_num: 3
  read_file_timeout: 12.5
  virtual_display: false
  result_ttl: 0
session:
  program: /usr/bin/driver
  args: ["--fast"]
  env:
    LANG: C
"#;
        let config = AppConfig::from_yaml(yaml).expect("yaml should parse");

        assert_eq!(config.socket_path, PathBuf::from("/tmp/test.sock"));
        assert_eq!(config.scheduler.queue_size, 8);
        assert_eq!(config.scheduler.workers_num, 3);
        assert_eq!(config.scheduler.read_file_timeout, Duration::from_millis(12_500));
        assert!(!config.scheduler.virtual_display);
        assert_eq!(config.scheduler.result_ttl, Duration::ZERO);
        // Unspecified fields keep their defaults.
        assert_eq!(config.scheduler.tasks_before_session_restart, 100);
        assert_eq!(config.session.program, "/usr/bin/driver");
        assert_eq!(config.session.args, vec!["--fast".to_string()]);
        assert_eq!(config.session.env.get("LANG"), Some(&"C".to_string()));
        assert_eq!(config.session.display.program, "Xvfb");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_app_config_rejects_negative_duration() {
        let yaml = "scheduler:\n  result_ttl: -3\n";
        assert!(matches!(AppConfig::from_yaml(yaml), Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn test_app_config_load_missing_file() {
        let err = AppConfig::load(Path::new("/nonexistent/activity-decoder.yaml"));
        assert!(matches!(err, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_app_config_requires_program() {
        let mut config = AppConfig::default();
        config.session.program = "  ".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "session.program",
                ..
            })
        ));
    }
}
