use std::path::{Path, PathBuf};
use std::time::Duration;

use regsteer_frame::{FrameConfig, DEFAULT_MAX_PAYLOAD};
use serde::Deserialize;
use tracing::debug;

use crate::error::{Result, SteerError};

/// Environment variable naming the scratch directory for persisted logs.
pub const ENV_STEER_DIRECTORY: &str = "REG_STEER_DIRECTORY";
/// Environment variable overriding the maximum message size in bytes.
pub const ENV_MAX_MSG_SIZE: &str = "REG_MAX_MSG_SIZE";

/// Behavior of a steering session, on either side of the link.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SteerConfig {
    /// Largest message accepted or sent, in bytes. Default: 1 MiB.
    pub max_message_size: usize,
    /// Read timeout applied to socket links, in milliseconds.
    pub read_timeout_ms: Option<u64>,
    /// Write timeout applied to socket links, in milliseconds.
    pub write_timeout_ms: Option<u64>,
    /// How long a steerer waits for the application's handshake.
    pub attach_timeout_ms: u64,
    /// Sleep between polls while paused or waiting with a deadline.
    pub pause_poll_interval_ms: u64,
    /// Send a status message every this many control-loop calls.
    pub status_interval: u32,
    /// Log messages sent per control-loop call, at most.
    pub max_log_messages_per_call: usize,
    /// Activity-log entries packed into one log message, at most.
    pub log_entries_per_message: usize,
    /// Default ring size for parameter value histories.
    pub param_history_capacity: usize,
    /// Where the activity log is persisted on finalize.
    pub scratch_dir: Option<PathBuf>,
}

impl Default for SteerConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_PAYLOAD,
            read_timeout_ms: None,
            write_timeout_ms: None,
            attach_timeout_ms: 5_000,
            pause_poll_interval_ms: 50,
            status_interval: 1,
            max_log_messages_per_call: 5,
            log_entries_per_message: 10,
            param_history_capacity: 100,
            scratch_dir: None,
        }
    }
}

impl SteerConfig {
    /// Parse a JSON document; omitted fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        debug!(?path, "loaded steering config");
        Self::from_json_str(&text)
    }

    /// Apply `REG_STEER_DIRECTORY` and `REG_MAX_MSG_SIZE` from the environment.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup.
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(dir) = lookup(ENV_STEER_DIRECTORY).filter(|d| !d.trim().is_empty()) {
            self.scratch_dir = Some(PathBuf::from(dir));
        }
        if let Some(size) = lookup(ENV_MAX_MSG_SIZE) {
            self.max_message_size = size.trim().parse().map_err(|_| {
                SteerError::Config(format!("{ENV_MAX_MSG_SIZE}='{size}' is not a byte count"))
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_message_size == 0 {
            return Err(SteerError::Config("max_message_size must be positive".into()));
        }
        if self.status_interval == 0 {
            return Err(SteerError::Config("status_interval must be positive".into()));
        }
        if self.log_entries_per_message == 0 {
            return Err(SteerError::Config(
                "log_entries_per_message must be positive".into(),
            ));
        }
        if self.param_history_capacity == 0 {
            return Err(SteerError::Config(
                "param_history_capacity must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            max_payload_size: self.max_message_size,
            read_timeout: self.read_timeout_ms.map(Duration::from_millis),
            write_timeout: self.write_timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn attach_timeout(&self) -> Duration {
        Duration::from_millis(self.attach_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.pause_poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SteerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.frame_config().max_payload_size, DEFAULT_MAX_PAYLOAD);
        assert_eq!(config.attach_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn json_overrides_some_fields() {
        let config = SteerConfig::from_json_str(
            r#"{ "status_interval": 4, "read_timeout_ms": 250, "scratch_dir": "/tmp/steer" }"#,
        )
        .unwrap();
        assert_eq!(config.status_interval, 4);
        assert_eq!(
            config.frame_config().read_timeout,
            Some(Duration::from_millis(250))
        );
        assert_eq!(config.scratch_dir, Some(PathBuf::from("/tmp/steer")));
        assert_eq!(config.log_entries_per_message, 10);
    }

    #[test]
    fn unknown_json_field_rejected() {
        assert!(matches!(
            SteerConfig::from_json_str(r#"{ "status_intreval": 4 }"#),
            Err(SteerError::Json(_))
        ));
    }

    #[test]
    fn invalid_values_rejected() {
        assert!(matches!(
            SteerConfig::from_json_str(r#"{ "status_interval": 0 }"#),
            Err(SteerError::Config(_))
        ));
    }

    #[test]
    fn env_style_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_STEER_DIRECTORY, "/scratch/run-4"),
            (ENV_MAX_MSG_SIZE, "4096"),
        ]
        .into_iter()
        .collect();
        let config = SteerConfig::default()
            .with_overrides_from(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.scratch_dir, Some(PathBuf::from("/scratch/run-4")));
        assert_eq!(config.max_message_size, 4096);
    }

    #[test]
    fn bad_size_override_is_config_error() {
        let result = SteerConfig::default().with_overrides_from(|key| {
            (key == ENV_MAX_MSG_SIZE).then(|| "lots".to_string())
        });
        assert!(matches!(result, Err(SteerError::Config(_))));
    }

    #[test]
    fn from_file_reads_json() {
        let dir = std::env::temp_dir().join(format!(
            "regsteer-config-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("steer.json");
        std::fs::write(&path, r#"{ "max_log_messages_per_call": 2 }"#).unwrap();

        let config = SteerConfig::from_file(&path).unwrap();
        assert_eq!(config.max_log_messages_per_call, 2);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
