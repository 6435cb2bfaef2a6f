//! The `ocr` subcommand.

use std::time::Duration;

use clap::Args;
use futures::{StreamExt as _, stream};
use ocr_dispatch::{
    JobStatus, Orchestrator, SubmitRequest,
    async_utils::io::{JsonStream, write_output},
    params::RawParams,
    prelude::*,
};

use super::ServiceOpts;
use crate::ui::Ui;

/// OCR command line arguments.
#[derive(Debug, Args)]
pub struct OcrOpts {
    /// Files to OCR.
    #[clap(value_name = "FILE", required = true)]
    pub input_paths: Vec<PathBuf>,

    /// The engine to use.
    #[clap(short = 'e', long)]
    pub engine: String,

    /// An engine parameter, as `NAME=VALUE`. May be repeated. Values are
    /// parsed as JSON if possible, and as strings otherwise.
    #[clap(short = 'p', long = "param", value_name = "NAME=VALUE")]
    pub params: Vec<String>,

    /// Engine parameters as a JSON object. Merged with `--param`.
    #[clap(long, value_name = "JSON")]
    pub params_json: Option<String>,

    #[clap(flatten)]
    pub service: ServiceOpts,

    /// What portion of inputs should we allow to fail? Specified as a
    /// number between 0.0 and 1.0.
    #[clap(long, default_value = "0.01")]
    pub allowed_failure_rate: f32,

    /// The output path to write JSONL results to.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `ocr` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_ocr(ui: Ui, opts: &OcrOpts) -> Result<()> {
    let params = parse_params(opts.params_json.as_deref(), &opts.params)?;
    let config = opts.service.load_config().await?;
    let orchestrator = Orchestrator::with_default_engines(config).await?;
    let reaper = orchestrator.spawn_reaper();

    // Submit everything up front, so GPU jobs queue in input order.
    let mut receipts = Vec::with_capacity(opts.input_paths.len());
    for path in &opts.input_paths {
        let receipt = orchestrator
            .submit(SubmitRequest {
                engine: Some(opts.engine.clone()),
                params: params.clone(),
                path: path.clone(),
            })
            .map_err(|err| anyhow!("{} ({})", err, err.kind()))
            .with_context(|| format!("cannot submit {}", path.display()))?;
        receipts.push((path.clone(), receipt));
    }

    // Every job ends by its own deadline. The slack covers bookkeeping.
    let wait = orchestrator.config().job_timeout + Duration::from_secs(5);
    let total = receipts.len();
    let progress = ui.job_progress(total);
    let output: JsonStream = {
        let progress = progress.clone();
        stream::iter(receipts)
            .map(move |(path, receipt)| {
                let orchestrator = orchestrator.clone();
                let progress = progress.clone();
                async move {
                    let view = orchestrator.await_result(receipt.job_id, wait).await?;
                    progress.record(view.status);
                    let hocr = match view.status {
                        JobStatus::Completed => {
                            Some(orchestrator.get_result(receipt.job_id)?.to_string())
                        }
                        _ => {
                            warn!(
                                path = %path.display(),
                                status = %view.status,
                                "OCR failed: {}",
                                view.error_message.as_deref().unwrap_or("unknown error"),
                            );
                            None
                        }
                    };
                    Ok::<_, anyhow::Error>(json!({
                        "path": path.display().to_string(),
                        "job_id": receipt.job_id,
                        "status": view.status,
                        "error_kind": view.error_kind,
                        "error_message": view.error_message,
                        "hocr": hocr,
                    }))
                }
            })
            .buffered(total.max(1))
            .boxed()
    };
    let written = write_output(opts.output_path.as_deref(), output).await;
    reaper.abort();
    written?;
    progress.finish();

    let failed = progress.failed();
    if total > 0 && failed as f32 / total as f32 > opts.allowed_failure_rate {
        return Err(anyhow!(
            "{failed} of {total} files failed, more than the allowed failure rate"
        ));
    }
    Ok(())
}

/// Combine `--params-json` and `--param` values. `--param` wins.
fn parse_params(params_json: Option<&str>, params: &[String]) -> Result<RawParams> {
    let mut raw = match params_json {
        Some(json) => match serde_json::from_str::<Value>(json)
            .context("--params-json is not valid JSON")?
        {
            Value::Object(map) => map,
            _ => return Err(anyhow!("--params-json must be a JSON object")),
        },
        None => RawParams::new(),
    };
    for param in params {
        let (name, value) = param
            .split_once('=')
            .ok_or_else(|| anyhow!("expected NAME=VALUE, found {param:?}"))?;
        let value = serde_json::from_str::<Value>(value)
            .unwrap_or_else(|_| Value::String(value.to_owned()));
        raw.insert(name.trim().to_owned(), value);
    }
    Ok(raw)
}
