//! Configuration management

use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub services: ServiceManagerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BusConfig {
    /// Queue transport address (`memory://` is the built-in store)
    pub queue_url: String,
    /// Re-deliveries before an event is dead-lettered
    pub max_retries: u32,
    /// Base retry delay in seconds; attempt `n` waits `n * retry_delay_secs`
    pub retry_delay_secs: f64,
    /// General worker loops (the priority loop comes on top)
    pub worker_count: usize,
    /// Park exhausted events in `dead_letter_queue`
    pub enable_dead_letter: bool,
    /// Per-lane capacity; pushes beyond it are rejected
    pub max_queue_size: usize,
    /// Upper bound for a single handler invocation
    pub handler_timeout_secs: f64,
    /// How long a general worker blocks on empty lanes before re-polling
    pub idle_poll_ms: u64,
    /// How long the priority loop blocks on empty priority lanes
    pub priority_poll_ms: u64,
    /// Wait for in-flight dispatches on shutdown
    pub shutdown_grace_secs: f64,
    /// Skip the second copy of dual-written High/Critical events
    pub dedupe_priority_copies: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceManagerConfig {
    /// Seconds between health-check passes
    pub health_check_interval_secs: u64,
    /// Upper bound for a single provider call
    pub call_timeout_secs: f64,
    /// Wait for the health-check loop on shutdown
    pub shutdown_grace_secs: f64,
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

impl BusConfig {
    pub fn retry_delay(&self) -> Duration {
        secs(self.retry_delay_secs)
    }

    pub fn handler_timeout(&self) -> Duration {
        secs(self.handler_timeout_secs)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn priority_poll(&self) -> Duration {
        Duration::from_millis(self.priority_poll_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        secs(self.shutdown_grace_secs)
    }
}

impl ServiceManagerConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        secs(self.call_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        secs(self.shutdown_grace_secs)
    }
}

impl Config {
    /// Load configuration from file, with `ORCHESTRATOR__SECTION__KEY` overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        dotenvy::dotenv().ok();

        let path = path.as_ref().to_str().ok_or_else(|| {
            OrchestratorError::Config(format!("non UTF-8 config path: {}", path.as_ref().display()))
        })?;

        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("ORCHESTRATOR").separator("__"))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from default locations, falling back to built-in defaults
    pub fn load_default() -> Result<Self> {
        let paths = [
            "orchestrator.toml",
            "config.toml",
            "~/.config/trade-orchestrator/config.toml",
        ];

        for path in paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::load(expanded.as_ref());
            }
        }

        tracing::warn!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    /// Reject settings the runtime cannot honour
    pub fn validate(&self) -> Result<()> {
        let bus = &self.bus;
        if bus.queue_url.trim().is_empty() {
            return Err(OrchestratorError::Config("bus.queue_url is empty".to_string()));
        }
        if bus.worker_count == 0 {
            return Err(OrchestratorError::Config("bus.worker_count must be at least 1".to_string()));
        }
        if bus.max_queue_size == 0 {
            return Err(OrchestratorError::Config("bus.max_queue_size must be at least 1".to_string()));
        }
        if !(bus.retry_delay_secs >= 0.0 && bus.retry_delay_secs.is_finite()) {
            return Err(OrchestratorError::Config("bus.retry_delay_secs must be >= 0".to_string()));
        }
        if !(bus.handler_timeout_secs > 0.0 && bus.handler_timeout_secs.is_finite()) {
            return Err(OrchestratorError::Config("bus.handler_timeout_secs must be > 0".to_string()));
        }
        if self.services.health_check_interval_secs == 0 {
            return Err(OrchestratorError::Config(
                "services.health_check_interval_secs must be > 0".to_string(),
            ));
        }
        if !(self.services.call_timeout_secs > 0.0 && self.services.call_timeout_secs.is_finite()) {
            return Err(OrchestratorError::Config("services.call_timeout_secs must be > 0".to_string()));
        }
        Ok(())
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_url: "memory://".to_string(),
            max_retries: 3,
            retry_delay_secs: 1.0,
            worker_count: 3,
            enable_dead_letter: true,
            max_queue_size: 10_000,
            handler_timeout_secs: 30.0,
            idle_poll_ms: 100,
            priority_poll_ms: 50,
            shutdown_grace_secs: 5.0,
            dedupe_priority_copies: true,
        }
    }
}

impl Default for ServiceManagerConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 60,
            call_timeout_secs: 30.0,
            shutdown_grace_secs: 5.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.bus.max_retries, 3);
        assert_eq!(config.bus.retry_delay(), Duration::from_secs(1));
        assert_eq!(config.bus.worker_count, 3);
        assert_eq!(config.services.health_check_interval(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = Config::default();
        config.bus.worker_count = 0;
        assert!(matches!(config.validate(), Err(OrchestratorError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_negative_delay() {
        let mut config = Config::default();
        config.bus.retry_delay_secs = -1.0;
        assert!(config.validate().is_err());
        // Never panics when building the Duration either
        assert_eq!(config.bus.retry_delay(), Duration::ZERO);
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let dir = std::env::temp_dir().join(format!("orchestrator-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("orchestrator.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[bus]\nmax_retries = 5\nretry_delay_secs = 0.5\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.bus.max_retries, 5);
        assert_eq!(config.bus.retry_delay(), Duration::from_millis(500));
        assert_eq!(config.bus.worker_count, 3);
        assert_eq!(config.services.health_check_interval_secs, 60);

        std::fs::remove_dir_all(&dir).ok();
    }
}
