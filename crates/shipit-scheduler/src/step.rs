//! Running a single step: command execution with log streaming.

use futures::StreamExt;
use shipit_config::VariableContext;
use shipit_core::executor::{Executor, JobSpec, JobStatus, LogLine, LogStream};
use shipit_core::{Error, Result};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::orchestrator::PipelineEvent;

/// How long to keep reading output after a job exits.
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub(crate) async fn emit(tx: &mpsc::Sender<PipelineEvent>, event: PipelineEvent) {
    let _ = tx.send(event).await;
}

pub(crate) async fn system_log(tx: &mpsc::Sender<PipelineEvent>, stage: &str, message: String) {
    emit(
        tx,
        PipelineEvent::StageLog {
            stage: stage.to_string(),
            line: LogLine::system(message),
        },
    )
    .await;
}

/// Wrap `work` in `StepStarted`/`StepCompleted` events.
pub(crate) async fn tracked<T, F>(
    tx: &mpsc::Sender<PipelineEvent>,
    stage: &str,
    step: &'static str,
    work: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    emit(
        tx,
        PipelineEvent::StepStarted {
            stage: stage.to_string(),
            step: step.to_string(),
        },
    )
    .await;

    let result = work.await;

    if let Err(e) = &result {
        warn!(stage, step, error = %e, "Step failed");
    }
    emit(
        tx,
        PipelineEvent::StepCompleted {
            stage: stage.to_string(),
            step: step.to_string(),
            success: result.is_ok(),
        },
    )
    .await;
    result
}

/// Run `job` to completion, streaming masked output as stage logs.
///
/// Returns the captured output lines. A non-zero exit becomes `fail(message)`.
pub(crate) async fn run_job(
    executor: &Arc<dyn Executor>,
    tx: &mpsc::Sender<PipelineEvent>,
    ctx: &VariableContext,
    stage: &str,
    job: JobSpec,
    fail: fn(String) -> Error,
) -> Result<Vec<String>> {
    let script = ctx.mask(&job.script());
    if !executor.can_execute(&job).await {
        return Err(fail(format!(
            "{} executor cannot run `{}`",
            executor.name(),
            script
        )));
    }

    info!(stage, job_id = %job.id, command = %script, "Running command");
    system_log(tx, stage, format!("$ {}", script)).await;

    let handle = executor
        .spawn(job)
        .await
        .map_err(|e| fail(format!("failed to start `{}`: {}", script, e)))?;
    let log_stream = executor
        .logs(&handle)
        .await
        .map_err(|e| fail(format!("failed to read output: {}", e)))?;

    let stage_name = stage.to_string();
    let tx_clone = tx.clone();
    let masker = ctx.clone();
    let captured = Arc::new(Mutex::new(Vec::new()));
    let sink = captured.clone();
    let mut log_handle = tokio::spawn(async move {
        let mut stream = log_stream;
        while let Some(mut line) = stream.next().await {
            line.content = masker.mask(&line.content);
            if line.stream != LogStream::System {
                sink.lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push(line.content.clone());
            }
            let _ = tx_clone
                .send(PipelineEvent::StageLog {
                    stage: stage_name.clone(),
                    line,
                })
                .await;
        }
    });

    let result = executor.wait(&handle).await;

    // Output may still be buffered after exit; stop following it after a grace period
    if tokio::time::timeout(LOG_DRAIN_TIMEOUT, &mut log_handle)
        .await
        .is_err()
    {
        debug!(stage, "Output still open after exit, detaching");
        log_handle.abort();
    }
    let output = std::mem::take(
        &mut *captured
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()),
    );

    let result = result.map_err(|e| fail(format!("failed to wait for `{}`: {}", script, e)))?;
    match result.status {
        JobStatus::Succeeded { .. } => Ok(output),
        JobStatus::Failed { message, .. } => Err(fail(format!("`{}` {}", script, message))),
        JobStatus::Cancelled { .. } => Err(Error::Cancelled),
        other => Err(fail(format!("`{}` ended in unexpected state {:?}", script, other))),
    }
}

/// Quote `value` for `/bin/sh`.
pub(crate) fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:@=+".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}
