//! Service configuration.
//!
//! Read from an optional TOML file. Durations are given in seconds:
//!
//! ```toml
//! max_concurrent_gpu = 2
//! job_timeout_secs = 300
//! retention_secs = 3600
//! probe_timeout_secs = 30
//! reaper_interval_secs = 60
//! ```

use std::time::Duration;

use crate::{
    async_utils::io::read_to_string,
    prelude::*,
    toml_utils::toml_to_json,
};

/// Tunable limits for the orchestrator.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// How many GPU jobs may run at once.
    pub max_concurrent_gpu: usize,

    /// Total time budget per job, covering both queueing and execution.
    #[serde(rename = "job_timeout_secs", with = "seconds")]
    pub job_timeout: Duration,

    /// How long finished jobs are kept.
    #[serde(rename = "retention_secs", with = "seconds")]
    pub retention: Duration,

    /// How long each engine may take to answer its startup probe.
    #[serde(rename = "probe_timeout_secs", with = "seconds")]
    pub probe_timeout: Duration,

    /// How often to purge expired jobs.
    #[serde(rename = "reaper_interval_secs", with = "seconds")]
    pub reaper_interval: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_gpu: 2,
            job_timeout: Duration::from_secs(300),
            retention: Duration::from_secs(3600),
            probe_timeout: Duration::from_secs(30),
            reaper_interval: Duration::from_secs(60),
        }
    }
}

impl ServiceConfig {
    /// Parse and check a TOML config. Missing keys take their defaults.
    pub fn from_toml(toml: &str) -> Result<Self> {
        let value = toml_to_json(toml).context("invalid TOML")?;
        let config = serde_json::from_value::<ServiceConfig>(value)
            .context("invalid service configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, or use the defaults if there is no path.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let toml = read_to_string(path).await?;
                Self::from_toml(&toml)
                    .with_context(|| format!("cannot load config from {}", path.display()))
            }
            None => Ok(Self::default()),
        }
    }

    /// Reject settings that can never work.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_gpu == 0 {
            return Err(anyhow!("max_concurrent_gpu must be at least 1"));
        }
        for (name, value) in [
            ("job_timeout_secs", self.job_timeout),
            ("probe_timeout_secs", self.probe_timeout),
            ("reaper_interval_secs", self.reaper_interval),
        ] {
            if value.is_zero() {
                return Err(anyhow!("{name} must be greater than 0"));
            }
        }
        Ok(())
    }
}

/// (De)serialize a [`Duration`] as a number of seconds.
mod seconds {
    use std::time::Duration;

    use serde::{Deserialize as _, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|_| D::Error::custom(format!("invalid number of seconds: {secs}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_keys_take_defaults() {
        let config = ServiceConfig::from_toml("max_concurrent_gpu = 4\n").unwrap();
        assert_eq!(config.max_concurrent_gpu, 4);
        assert_eq!(config.job_timeout, Duration::from_secs(300));
        assert_eq!(ServiceConfig::from_toml("").unwrap(), ServiceConfig::default());
    }

    #[test]
    fn test_fractional_seconds() {
        let config = ServiceConfig::from_toml("job_timeout_secs = 1.5\n").unwrap();
        assert_eq!(config.job_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_rejects_bad_configs() {
        assert!(ServiceConfig::from_toml("max_concurrent_gpu = 0\n").is_err());
        assert!(ServiceConfig::from_toml("job_timeout_secs = -1\n").is_err());
        assert!(ServiceConfig::from_toml("gpus = 2\n").is_err());
        assert!(ServiceConfig::from_toml("max_concurrent_gpu = [").is_err());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("service.toml");
        std::fs::write(&path, "retention_secs = 10\n").unwrap();
        let config = ServiceConfig::load(Some(&path)).await.unwrap();
        assert_eq!(config.retention, Duration::from_secs(10));
        assert_eq!(ServiceConfig::load(None).await.unwrap(), ServiceConfig::default());
    }
}
