//! Built-in job handlers available to every worker

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::process::Command;
use tracing::{debug, info};

use super::{JobHandler, StopSignal, WorkerError};
use crate::backend::JobContext;

/// Keep only this much of a command's output in the result.
const OUTPUT_TAIL_BYTES: usize = 4096;

#[derive(Debug, Deserialize)]
struct ShellParameters {
    command: String,
    #[serde(default)]
    args: Vec<String>,
}

/// `shell`: runs `command args...` and reports its exit code and output tail.
/// The child is killed if a stop is requested before it exits.
#[derive(Debug, Default)]
pub struct ShellHandler;

fn tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let start = text.len().saturating_sub(OUTPUT_TAIL_BYTES);
    let start = (start..text.len())
        .find(|i| text.is_char_boundary(*i))
        .unwrap_or(text.len());
    text[start..].to_string()
}

#[async_trait]
impl JobHandler for ShellHandler {
    fn job_type(&self) -> &str {
        "shell"
    }

    async fn run(&self, context: &JobContext, stop: &StopSignal) -> Result<serde_json::Value, WorkerError> {
        let params: ShellParameters = serde_json::from_value(context.parameters.clone())
            .map_err(|e| WorkerError::InvalidParameters(e.to_string()))?;

        info!(job_id = %context.job_id, command = %params.command, "Running shell job");
        let child = Command::new(&params.command)
            .args(&params.args)
            .envs(&context.connection)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Dropping the wait future drops the child, which kills it.
        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            _ = stop.stopped() => return Err(WorkerError::Interrupted),
        };

        let exit_code = output.status.code().unwrap_or(-1);
        debug!(job_id = %context.job_id, exit_code, "Shell job exited");
        if !output.status.success() {
            return Err(WorkerError::Failed(format!(
                "{} exited with {exit_code}: {}",
                params.command,
                tail(&output.stderr).trim()
            )));
        }

        Ok(json!({
            "exit_code": exit_code,
            "stdout": tail(&output.stdout),
        }))
    }
}

#[derive(Debug, Deserialize)]
struct SleepParameters {
    seconds: u64,
}

/// `sleep`: waits, checking the stop signal at its interval. Used for smoke
/// tests of dispatch and cancellation.
#[derive(Debug, Default)]
pub struct SleepHandler;

#[async_trait]
impl JobHandler for SleepHandler {
    fn job_type(&self) -> &str {
        "sleep"
    }

    async fn run(&self, context: &JobContext, stop: &StopSignal) -> Result<serde_json::Value, WorkerError> {
        let params: SleepParameters = serde_json::from_value(context.parameters.clone())
            .map_err(|e| WorkerError::InvalidParameters(e.to_string()))?;

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(params.seconds)) => Ok(json!({ "slept_secs": params.seconds })),
            _ = stop.stopped() => Err(WorkerError::Interrupted),
        }
    }
}
