//! Local process executor.
//!
//! Runs build commands as child processes of the pipeline runner. Children
//! are killed when their handle is dropped, so cancelling a run never leaves
//! a step running in the background.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use shipit_core::executor::*;
use shipit_core::{Error, JobId, Result};
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_stream::wrappers::LinesStream;
use tracing::{debug, info, warn};

struct RunningJob {
    child: Child,
    started_at: DateTime<Utc>,
    timeout: Option<Duration>,
}

/// Executes jobs as local child processes.
#[derive(Default)]
pub struct LocalProcessExecutor {
    jobs: Mutex<HashMap<JobId, RunningJob>>,
}

impl LocalProcessExecutor {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Executor for LocalProcessExecutor {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn can_execute(&self, spec: &JobSpec) -> bool {
        match &spec.working_dir {
            Some(dir) => !spec.command.is_empty() && dir.is_dir(),
            None => !spec.command.is_empty(),
        }
    }

    async fn spawn(&self, spec: JobSpec) -> Result<JobHandle> {
        let (program, args) = spec
            .command
            .split_first()
            .ok_or_else(|| Error::InvalidInput("job has no command".to_string()))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|e| {
            Error::ExecutionFailed(format!("failed to start `{}`: {}", program, e))
        })?;
        let pid = child.id().map(|p| p.to_string()).unwrap_or_default();

        info!(job_id = %spec.id, pid = %pid, "Spawned job");

        self.jobs.lock().await.insert(
            spec.id,
            RunningJob {
                child,
                started_at: Utc::now(),
                timeout: spec.timeout,
            },
        );

        Ok(JobHandle {
            id: spec.id,
            executor_id: pid,
            executor_name: self.name().to_string(),
        })
    }

    async fn logs(&self, handle: &JobHandle) -> Result<BoxStream<'static, LogLine>> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&handle.id)
            .ok_or_else(|| Error::NotFound(format!("job {}", handle.id)))?;

        let stdout = match job.child.stdout.take() {
            Some(out) => LinesStream::new(BufReader::new(out).lines())
                .filter_map(|line| async move { line.ok().map(|l| LogLine::new(LogStream::Stdout, l)) })
                .boxed(),
            None => stream::empty().boxed(),
        };
        let stderr = match job.child.stderr.take() {
            Some(err) => LinesStream::new(BufReader::new(err).lines())
                .filter_map(|line| async move { line.ok().map(|l| LogLine::new(LogStream::Stderr, l)) })
                .boxed(),
            None => stream::empty().boxed(),
        };

        Ok(stream::select(stdout, stderr).boxed())
    }

    async fn wait(&self, handle: &JobHandle) -> Result<JobResult> {
        let mut job = self
            .jobs
            .lock()
            .await
            .remove(&handle.id)
            .ok_or_else(|| Error::NotFound(format!("job {}", handle.id)))?;

        let waited = match job.timeout {
            Some(limit) => tokio::time::timeout(limit, job.child.wait()).await,
            None => Ok(job.child.wait().await),
        };
        let finished_at = Utc::now();

        let status = match waited {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(Error::ExecutionFailed(format!(
                    "failed to wait for job {}: {}",
                    handle.id, e
                )));
            }
            Err(_) => {
                if let Err(e) = job.child.kill().await {
                    warn!(job_id = %handle.id, error = %e, "Failed to kill timed out job");
                }
                let limit = job.timeout.unwrap_or_default();
                return Ok(JobResult {
                    status: JobStatus::Failed {
                        started_at: Some(job.started_at),
                        finished_at,
                        exit_code: None,
                        message: format!("timed out after {}s", limit.as_secs()),
                    },
                    exit_code: None,
                });
            }
        };

        debug!(job_id = %handle.id, status = %status, "Job exited");

        let exit_code = status.code();
        let status = if status.success() {
            JobStatus::Succeeded {
                started_at: job.started_at,
                finished_at,
            }
        } else {
            JobStatus::Failed {
                started_at: Some(job.started_at),
                finished_at,
                exit_code,
                message: match exit_code {
                    Some(code) => format!("exited with code {}", code),
                    None => "terminated by signal".to_string(),
                },
            }
        };

        Ok(JobResult { status, exit_code })
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<()> {
        let job = self.jobs.lock().await.remove(&handle.id);
        if let Some(mut job) = job {
            info!(job_id = %handle.id, "Cancelling job");
            job.child
                .kill()
                .await
                .map_err(|e| Error::Internal(format!("failed to kill job {}: {}", handle.id, e)))?;
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    async fn run(spec: JobSpec) -> (Vec<LogLine>, JobResult) {
        let executor = LocalProcessExecutor::new();
        let handle = executor.spawn(spec).await.unwrap();
        let logs = executor.logs(&handle).await.unwrap();
        let result = executor.wait(&handle).await.unwrap();
        let lines = logs.collect::<Vec<_>>().await;
        (lines, result)
    }

    #[tokio::test]
    async fn test_successful_job_streams_output() {
        let spec = JobSpec::shell(&["echo hello".to_string(), "echo oops >&2".to_string()]);
        let (lines, result) = run(spec).await;

        assert!(matches!(result.status, JobStatus::Succeeded { .. }));
        assert_eq!(result.exit_code, Some(0));
        assert!(
            lines
                .iter()
                .any(|l| l.stream == LogStream::Stdout && l.content == "hello")
        );
        assert!(
            lines
                .iter()
                .any(|l| l.stream == LogStream::Stderr && l.content == "oops")
        );
    }

    #[tokio::test]
    async fn test_failing_job_reports_exit_code() {
        let (_, result) = run(JobSpec::shell(&["exit 3".to_string()])).await;
        match result.status {
            JobStatus::Failed { exit_code, .. } => assert_eq!(exit_code, Some(3)),
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_kills_job() {
        let spec = JobSpec::shell(&["sleep 5".to_string()])
            .with_timeout(Some(Duration::from_millis(100)));
        let (_, result) = run(spec).await;
        match result.status {
            JobStatus::Failed { message, .. } => assert!(message.contains("timed out")),
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_env_and_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = HashMap::new();
        env.insert("GREETING".to_string(), "hi".to_string());
        let spec = JobSpec::shell(&["echo $GREETING && pwd".to_string()])
            .in_dir(dir.path())
            .with_env(env);
        let (lines, result) = run(spec).await;

        assert!(matches!(result.status, JobStatus::Succeeded { .. }));
        assert_eq!(lines.iter().filter(|l| l.content == "hi").count(), 1);
    }

    #[tokio::test]
    async fn test_missing_program() {
        let executor = LocalProcessExecutor::new();
        let spec = JobSpec {
            command: vec!["/definitely/not/a/program".to_string()],
            ..JobSpec::shell(&[])
        };
        assert!(matches!(
            executor.spawn(spec).await,
            Err(Error::ExecutionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_unknown_job_is_noop() {
        let executor = LocalProcessExecutor::new();
        let handle = JobHandle {
            id: JobId::new(),
            executor_id: String::new(),
            executor_name: "local".to_string(),
        };
        assert!(executor.cancel(&handle).await.is_ok());
    }
}
