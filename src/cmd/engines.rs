//! The `engines` subcommand.

use clap::Args;
use ocr_dispatch::{Orchestrator, async_utils::io::create_writer, prelude::*};
use tokio::io::AsyncWriteExt as _;

use super::ServiceOpts;

/// Engines command line arguments.
#[derive(Debug, Args)]
pub struct EnginesOpts {
    #[clap(flatten)]
    pub service: ServiceOpts,

    /// The output path to write the engine list to.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `engines` subcommand. Probes every engine and prints what it found.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_engines(opts: &EnginesOpts) -> Result<()> {
    let config = opts.service.load_config().await?;
    let orchestrator = Orchestrator::with_default_engines(config).await?;
    let engines = orchestrator.list_engines();

    let mut wtr = create_writer(opts.output_path.as_deref()).await?;
    let engines_str =
        serde_json::to_string_pretty(&engines).context("failed to serialize engines")?;
    wtr.write_all(engines_str.as_bytes())
        .await
        .context("failed to write engines")?;
    wtr.write_all(b"\n")
        .await
        .context("failed to write engines")?;
    wtr.flush().await.context("failed to flush engines")?;
    Ok(())
}
