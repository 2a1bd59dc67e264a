use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use uuid::Uuid;

use crate::agent::handlers::{HandlerError, JobContext, JobHandler};

/// Runs the payload as a `sh -c` command line.
///
/// There is no sandbox: the command runs with the node's own privileges.
/// The child is killed if the job is canceled.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellHandler;

#[async_trait]
impl JobHandler for ShellHandler {
    fn validate(&self, payload: &str) -> Result<(), HandlerError> {
        if payload.trim().is_empty() {
            return Err(HandlerError::InvalidPayload("empty command".to_string()));
        }
        Ok(())
    }

    async fn run(&self, ctx: JobContext) -> Result<Option<String>, HandlerError> {
        let job_id = ctx.job().id;
        let command = ctx.payload().to_string();
        tracing::info!(job_id = %job_id, command = %command, "Executing shell job");

        let child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        tokio::select! {
            _ = ctx.cancelled() => {
                tracing::info!(job_id = %job_id, "Shell job canceled, killing process");
                Err(HandlerError::Canceled)
            }
            output = child.wait_with_output() => process_output(job_id, output),
        }
    }
}

fn process_output(
    job_id: Uuid,
    result: Result<std::process::Output, std::io::Error>,
) -> Result<Option<String>, HandlerError> {
    let output = result.map_err(|e| {
        tracing::error!(job_id = %job_id, error = %e, "Shell job could not be awaited");
        HandlerError::Io(e)
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
    let exit_code = output.status.code();

    tracing::info!(
        job_id = %job_id,
        success = output.status.success(),
        exit_code = ?exit_code,
        "Shell job completed"
    );

    if output.status.success() {
        Ok(if stdout.is_empty() { None } else { Some(stdout) })
    } else if stderr.is_empty() {
        Err(HandlerError::Failed(format!("Exit code: {:?}", exit_code)))
    } else {
        Err(HandlerError::Failed(stderr))
    }
}
