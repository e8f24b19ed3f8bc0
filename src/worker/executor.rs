use std::process::{Output, Stdio};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::scheduler::job::{FailureKind, JobDescription, JobOutcome};
use crate::worker::dispatcher::{JobRunner, OutcomeFuture};

/// Bytes of stdout/stderr kept on an outcome for diagnostics.
const DIAGNOSTIC_TAIL_BYTES: usize = 4096;
const READ_CHUNK_BYTES: usize = 8192;

/// Runs job descriptions as external OS processes.
///
/// Each job gets its own process started from the job's output directory
/// (nextflow keeps per-directory session state). Output is piped and drained
/// while the process runs, keeping only a bounded tail. The process is killed when its timeout elapses or
/// the shutdown token is cancelled.
#[derive(Debug, Clone, Default)]
pub struct JobExecutor {
    timeout: Option<Duration>,
    shutdown: CancellationToken,
}

impl JobExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Launch `job` and wait for it.
    pub async fn execute(&self, job: JobDescription) -> JobOutcome {
        self.launch(job).await
    }

    fn process_output(
        job: &JobDescription,
        started_at: DateTime<Utc>,
        result: Result<std::process::Output, std::io::Error>,
    ) -> JobOutcome {
        match result {
            Ok(output) => {
                let stdout = tail(&output.stdout);
                let stderr = tail(&output.stderr);
                let exit_code = output.status.code();

                let outcome = if output.status.success() {
                    JobOutcome::completed(job, exit_code)
                } else {
                    JobOutcome::failed(
                        job,
                        FailureKind::NonZeroExit,
                        Some(stderr.unwrap_or_else(|| format!("Exit code: {:?}", exit_code))),
                    )
                    .with_exit_code(exit_code)
                };

                tracing::info!(
                    job_id = %job.id,
                    key = %job.key,
                    status = %outcome.status,
                    exit_code = ?exit_code,
                    "Job finished"
                );

                outcome.with_output(stdout).started_at(started_at)
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, key = %job.key, error = %e, "Job execution failed");
                JobOutcome::failed(job, FailureKind::Spawn, Some(e.to_string()))
                    .started_at(started_at)
            }
        }
    }
}

impl JobRunner for JobExecutor {
    fn launch(&self, job: JobDescription) -> OutcomeFuture {
        tracing::info!(
            job_id = %job.id,
            key = %job.key,
            pipeline = %job.label,
            program = %job.program,
            "Launching job"
        );

        let started_at = Utc::now();
        let mut command = Command::new(&job.program);
        command
            .args(&job.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if job.output_dir.is_dir() {
            command.current_dir(&job.output_dir);
        }
        let spawned = command.spawn();

        let timeout = self.timeout;
        let shutdown = self.shutdown.clone();

        Box::pin(async move {
            let mut child = match spawned {
                Ok(child) => child,
                Err(e) => {
                    tracing::error!(job_id = %job.id, key = %job.key, error = %e, "Failed to start job");
                    return JobOutcome::failed(&job, FailureKind::Spawn, Some(e.to_string()))
                        .started_at(started_at);
                }
            };

            let deadline = async move {
                match timeout {
                    Some(limit) => tokio::time::sleep(limit).await,
                    None => std::future::pending::<()>().await,
                }
            };

            let stdout = child.stdout.take();
            let stderr = child.stderr.take();
            let finished = async {
                let (status, stdout, stderr) =
                    tokio::join!(child.wait(), read_tail(stdout), read_tail(stderr));
                status.map(|status| Output {
                    status,
                    stdout,
                    stderr,
                })
            };

            // The child is dropped, and so killed, when this future returns.
            tokio::select! {
                result = finished => Self::process_output(&job, started_at, result),
                _ = deadline => {
                    tracing::warn!(job_id = %job.id, key = %job.key, timeout = ?timeout, "Job timed out, killing it");
                    JobOutcome::failed(
                        &job,
                        FailureKind::Timeout,
                        Some(format!("timed out after {:?}", timeout.unwrap_or_default())),
                    )
                    .started_at(started_at)
                }
                _ = shutdown.cancelled() => {
                    tracing::warn!(job_id = %job.id, key = %job.key, "Shutdown requested, killing job");
                    JobOutcome::failed(&job, FailureKind::Cancelled, Some("shutdown requested".to_string()))
                        .started_at(started_at)
                }
            }
        })
    }
}

/// Rolling window over the last `limit` bytes of a stream.
struct TailBuffer {
    bytes: Vec<u8>,
    limit: usize,
}

impl TailBuffer {
    fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(limit),
            limit,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let chunk = &chunk[chunk.len().saturating_sub(self.limit)..];
        let overflow = (self.bytes.len() + chunk.len()).saturating_sub(self.limit);
        self.bytes.drain(..overflow);
        self.bytes.extend_from_slice(chunk);
    }

    fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Drain `pipe` to EOF, keeping only its last `DIAGNOSTIC_TAIL_BYTES`.
async fn read_tail<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let Some(mut pipe) = pipe else {
        return Vec::new();
    };
    let mut tail = TailBuffer::new(DIAGNOSTIC_TAIL_BYTES);
    let mut chunk = [0u8; READ_CHUNK_BYTES];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => tail.push(&chunk[..n]),
            Err(e) => {
                tracing::debug!(error = %e, "Stopped reading job output");
                break;
            }
        }
    }
    tail.into_bytes()
}

fn tail(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }
    let start = bytes.len().saturating_sub(DIAGNOSTIC_TAIL_BYTES);
    Some(String::from_utf8_lossy(&bytes[start..]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_keeps_the_end() {
        let long = vec![b'a'; DIAGNOSTIC_TAIL_BYTES + 10];
        let kept = tail(&long).unwrap();
        assert_eq!(kept.len(), DIAGNOSTIC_TAIL_BYTES);
        assert!(tail(&[]).is_none());
    }

    #[test]
    fn tail_buffer_never_grows_past_its_limit() {
        let mut buffer = TailBuffer::new(8);
        for chunk in [&b"abc"[..], b"defgh", b"ijklmnopqrstuvwxyz", b"0"] {
            buffer.push(chunk);
            assert!(buffer.bytes.len() <= 8);
        }
        assert_eq!(buffer.into_bytes(), b"tuvwxyz0");
    }

    #[tokio::test]
    async fn read_tail_drains_a_large_stream() {
        let stream = tokio::io::repeat(b'x')
            .take(8 * 1024 * 1024)
            .chain(&b"last line\n"[..]);

        let kept = read_tail(Some(stream)).await;

        assert_eq!(kept.len(), DIAGNOSTIC_TAIL_BYTES);
        assert!(kept.ends_with(b"xlast line\n"));
        assert!(read_tail(None::<&[u8]>).await.is_empty());
    }
}
