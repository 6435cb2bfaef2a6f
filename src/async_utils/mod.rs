//! Asynchronous utilities for use with Tokio.
//!
//! Mostly this is about running external engine processes without blocking
//! the executor, and without leaving orphans behind when a job is abandoned.

use std::{pin::Pin, process::Stdio};

use futures::Stream;
use tokio::process::Command;

use crate::{engines::EngineError, prelude::*};

pub mod io;

/// A type alias for a boxed stream. This is used to make it easier to work
/// streams that return complex types.
pub type BoxedStream<Item> = Pin<Box<dyn Stream<Item = Item> + Send>>;

/// Run an engine's external command and collect its output.
///
/// The child is killed if the returned future is dropped, which is how a timed
/// out or cancelled job stops its engine. A missing executable is reported as
/// [`EngineError::Unavailable`], because it means the engine vanished after
/// startup.
#[instrument(level = "debug", skip(cmd))]
pub async fn run_engine_command(
    command_name: &str,
    cmd: &mut Command,
) -> Result<std::process::Output, EngineError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let output = match cmd.output().await {
        Ok(output) => output,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(EngineError::Unavailable(format!(
                "{command_name} executable not found"
            )));
        }
        Err(err) => {
            return Err(EngineError::Failed(
                anyhow::Error::new(err).context(format!("cannot run {command_name}")),
            ));
        }
    };
    check_for_command_failure(command_name, &output)?;
    Ok(output)
}

/// Run a probe command, returning its output only if it succeeded.
///
/// Used at startup. Failures are ordinary errors here, because the registry
/// turns them into "unavailable" rather than aborting.
pub async fn run_probe_command(
    command_name: &str,
    cmd: &mut Command,
) -> Result<std::process::Output> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let output = cmd
        .output()
        .await
        .with_context(|| format!("cannot run {command_name}"))?;
    check_for_command_failure(command_name, &output)?;
    Ok(output)
}

/// Log a finished command's output, and fail if it exited unsuccessfully.
///
/// Engines print harmless warnings to stderr all the time, so only the exit
/// status decides.
pub fn check_for_command_failure(
    command_name: &str,
    output: &std::process::Output,
) -> Result<()> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    trace!(
        command_name = command_name,
        output = %stdout,
        "Standard output from command"
    );
    if !stderr.trim().is_empty() {
        debug!(
            command_name = command_name,
            output = %stderr,
            "Standard error from command",
        );
    }

    if output.status.success() {
        Ok(())
    } else if let Some(exit_code) = output.status.code() {
        Err(anyhow!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr,
        ))
    } else {
        Err(anyhow!(
            "{} failed with error output:\n{}",
            command_name,
            stderr,
        ))
    }
}
