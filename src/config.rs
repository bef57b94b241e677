//! Runtime settings
//!
//! Read from the environment; command-line flags override individual
//! values afterwards.

use crate::error::{KeelError, Result};
use crate::reconcile::{Timeouts, STOP_SLACK};
use std::path::PathBuf;
use std::time::Duration;

/// Keel settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Engine address (`unix:///...`, `tcp://...`); `None` uses the local
    /// default socket
    pub docker_host: Option<String>,
    /// Where stacks created from pasted compose text are stored
    pub stacks_dir: PathBuf,
    /// Grace period before a stopping container is killed
    pub stop_timeout: Duration,
    /// Limit for a container start during a redeploy
    pub start_timeout: Duration,
    /// Limit for any single engine API request
    pub engine_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            docker_host: None,
            stacks_dir: default_stacks_dir(),
            stop_timeout: Duration::from_secs(10),
            start_timeout: Duration::from_secs(30),
            engine_timeout: Duration::from_secs(120),
        }
    }
}

impl Settings {
    /// Settings from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    /// Settings from an arbitrary variable source
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let mut settings = Self::default();
        let value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        settings.docker_host = value("KEEL_DOCKER_HOST").or_else(|| value("DOCKER_HOST"));
        if let Some(dir) = value("KEEL_STACKS_DIR") {
            settings.stacks_dir = PathBuf::from(dir);
        }
        if let Some(secs) = value("KEEL_STOP_TIMEOUT_SECS") {
            settings.stop_timeout = parse_secs("KEEL_STOP_TIMEOUT_SECS", &secs)?;
        }
        if let Some(secs) = value("KEEL_START_TIMEOUT_SECS") {
            settings.start_timeout = parse_secs("KEEL_START_TIMEOUT_SECS", &secs)?;
        }
        if let Some(secs) = value("KEEL_ENGINE_TIMEOUT_SECS") {
            settings.engine_timeout = parse_secs("KEEL_ENGINE_TIMEOUT_SECS", &secs)?;
        }

        settings.validate()?;
        Ok(settings)
    }

    /// A stop request must be able to outlive its grace period, or every
    /// slow stop would surface as an engine timeout
    pub fn validate(&self) -> Result<()> {
        if self.engine_timeout <= self.stop_timeout + STOP_SLACK {
            return Err(KeelError::InvalidConfig(format!(
                "engine timeout ({}s) must exceed the stop timeout ({}s) by more than {}s",
                self.engine_timeout.as_secs(),
                self.stop_timeout.as_secs(),
                STOP_SLACK.as_secs()
            )));
        }
        Ok(())
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            stop: self.stop_timeout,
            start: self.start_timeout,
        }
    }
}

fn default_stacks_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join("keel")
        .join("stacks")
}

fn parse_secs(key: &str, value: &str) -> Result<Duration> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| {
            KeelError::InvalidConfig(format!(
                "{} must be a whole number of seconds, got '{}'",
                key, value
            ))
        })
}
