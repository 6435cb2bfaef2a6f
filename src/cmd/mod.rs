//! Command-line entry points.

use std::time::Duration;

use clap::Args;
use ocr_dispatch::{ServiceConfig, prelude::*};

pub mod engines;
pub mod ocr;
pub mod schema;

/// Options shared by subcommands which start the service.
#[derive(Debug, Clone, Args)]
pub struct ServiceOpts {
    /// Service configuration file (TOML).
    #[clap(long = "config", value_name = "PATH")]
    config_path: Option<PathBuf>,

    /// How many GPU jobs may run at once.
    #[clap(long)]
    max_concurrent_gpu: Option<usize>,

    /// Total time budget per job, in seconds.
    #[clap(long = "timeout", value_name = "SECS")]
    job_timeout_secs: Option<f64>,

    /// How long each engine may take to answer its startup probe, in seconds.
    #[clap(long = "probe-timeout", value_name = "SECS")]
    probe_timeout_secs: Option<f64>,
}

impl ServiceOpts {
    /// Load our config file, if any, and apply command-line overrides.
    pub async fn load_config(&self) -> Result<ServiceConfig> {
        let mut config = ServiceConfig::load(self.config_path.as_deref()).await?;
        if let Some(max_concurrent_gpu) = self.max_concurrent_gpu {
            config.max_concurrent_gpu = max_concurrent_gpu;
        }
        if let Some(secs) = self.job_timeout_secs {
            config.job_timeout = seconds("--timeout", secs)?;
        }
        if let Some(secs) = self.probe_timeout_secs {
            config.probe_timeout = seconds("--probe-timeout", secs)?;
        }
        config.validate()?;
        debug!(?config, "Loaded service configuration");
        Ok(config)
    }
}

fn seconds(flag: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .with_context(|| format!("{flag} must be a non-negative number of seconds"))
}
