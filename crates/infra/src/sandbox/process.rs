//! Parent side of the sandbox: spawn, wait with an outer bound, escalate.

use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Instant;

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::child::TIMEOUT_EXIT_CODE;
use super::{Sandbox, SandboxError, SandboxInput, SandboxOutcome, SandboxReply, SandboxRequest};
use crate::config::SandboxConfig;
use crate::jobs::{SandboxReport, Termination};
use crate::storage::ArtifactStorage;

const ARTIFACT_FILE: &str = "artifact.bin";
/// Upper bound on the child's result line.
const MAX_REPLY_BYTES: u64 = 4 * 1024 * 1024;

/// One finished sandbox invocation, including the child's pid.
#[derive(Debug)]
pub struct Execution {
    pub pid: Option<u32>,
    pub result: Result<SandboxOutcome, SandboxError>,
}

/// Runs each job in a freshly spawned child process.
///
/// The child is placed in its own process group so escalation reaches
/// anything it forked.
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    config: SandboxConfig,
    storage: ArtifactStorage,
}

impl ProcessSandbox {
    pub fn new(config: SandboxConfig, storage: ArtifactStorage) -> Self {
        Self { config, storage }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run one job and report how the process ended.
    pub async fn execute(&self, input: SandboxInput) -> Execution {
        let scratch = self.storage.scratch_dir(input.job_id);
        let execution = self.execute_in(&scratch, input).await;
        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %scratch.display(), error = %e, "failed to remove sandbox scratch");
            }
        }
        execution
    }

    async fn execute_in(&self, scratch: &Path, input: SandboxInput) -> Execution {
        let job_id = input.job_id;
        let timeout_ms = u64::try_from(input.timeout.as_millis()).unwrap_or(u64::MAX);
        let spawn_error = |message: String| Execution {
            pid: None,
            result: Err(SandboxError::Spawn(message)),
        };

        if let Err(e) = tokio::fs::create_dir_all(scratch).await {
            return spawn_error(format!("scratch directory {}: {e}", scratch.display()));
        }
        let artifact_path = scratch.join(ARTIFACT_FILE);

        let request = SandboxRequest {
            job_id,
            source: input.source,
            options: input.options,
            timeout_ms,
            artifact_path: artifact_path.clone(),
            memory_limit_bytes: self.config.memory_limit_bytes,
        };
        let payload = match serde_json::to_vec(&request) {
            Ok(payload) => payload,
            Err(e) => return spawn_error(format!("encode request: {e}")),
        };

        let mut child = match Command::new(&self.config.program)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return spawn_error(format!("{}: {e}", self.config.program.display()));
            }
        };
        let started = Instant::now();
        let pid = child.id();
        debug!(job_id = %job_id, pid, "sandbox spawned");

        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!(job_id = %job_id, error = %e, "sandbox closed stdin early");
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(job_id = %job_id, child = %line, "sandbox stderr");
                }
            });
        }
        let Some(stdout) = child.stdout.take() else {
            let (termination, status) = terminate(&mut child, &self.config).await;
            let report = sandbox_report(pid, status, started, termination);
            return Execution {
                pid,
                result: Err(SandboxError::Protocol {
                    message: "stdout not captured".to_string(),
                    report,
                }),
            };
        };

        // Outer bound. The child's own guard fires at `timeout`.
        let bound = input.timeout + self.config.grace;
        let mut reader = BufReader::new(stdout).take(MAX_REPLY_BYTES);
        let mut buf = String::new();
        let first_line = timeout(bound, reader.read_line(&mut buf)).await;
        // Closing the pipe unblocks a child still writing past the cap.
        drop(reader);

        let line = match first_line {
            Err(_) => {
                warn!(job_id = %job_id, pid, bound_ms = bound.as_millis() as u64, "sandbox unresponsive; escalating");
                let (termination, status) = terminate(&mut child, &self.config).await;
                let report = sandbox_report(pid, status, started, termination);
                info!(job_id = %job_id, termination = %report.termination, "sandbox stopped");
                return Execution {
                    pid,
                    result: Err(SandboxError::TimedOut { timeout_ms, report }),
                };
            }
            Ok(Err(e)) => Err(format!("reading result: {e}")),
            Ok(Ok(0)) => Ok(None),
            Ok(Ok(n)) if n as u64 >= MAX_REPLY_BYTES && !buf.ends_with('\n') => {
                Err(format!("result line exceeds {MAX_REPLY_BYTES} bytes"))
            }
            Ok(Ok(_)) => Ok(Some(buf)),
        };

        // Give the child a moment to exit after reporting; anything left is stopped.
        let (termination, status) = match timeout(self.config.kill_grace, child.wait()).await {
            Ok(Ok(status)) => (Termination::Exited, Some(status)),
            _ => terminate(&mut child, &self.config).await,
        };
        let guard_fired = status.is_some_and(inner_guard_fired);
        let report = sandbox_report(pid, status, started, termination);

        let result = match line {
            Err(message) => Err(SandboxError::Protocol { message, report }),
            // The child's alarm or watchdog ended it before it could report.
            Ok(None) if guard_fired => Err(SandboxError::TimedOut { timeout_ms, report }),
            Ok(None) => Err(SandboxError::NoResult { report }),
            Ok(Some(line)) => {
                accept_reply(&line, &artifact_path, input.max_artifact_bytes, report).await
            }
        };
        Execution { pid, result }
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    async fn run(&self, input: SandboxInput) -> Result<SandboxOutcome, SandboxError> {
        self.execute(input).await.result
    }
}

async fn accept_reply(
    line: &str,
    artifact_path: &Path,
    max_artifact_bytes: u64,
    report: SandboxReport,
) -> Result<SandboxOutcome, SandboxError> {
    let reply: SandboxReply = match serde_json::from_str(line) {
        Ok(reply) => reply,
        Err(e) => {
            return Err(SandboxError::Protocol {
                message: e.to_string(),
                report,
            });
        }
    };

    match reply {
        SandboxReply::Failure {
            kind,
            error,
            diagnostics,
        } => Ok(SandboxOutcome::Failure {
            kind,
            error,
            diagnostics: diagnostics.with_sandbox(Some(report)),
        }),
        SandboxReply::Success {
            page_count,
            size_bytes,
            diagnostics,
        } => {
            let unreadable = |e: std::io::Error, report| SandboxError::Artifact {
                message: format!("{}: {e}", artifact_path.display()),
                report,
            };
            // Size is settled on metadata so an oversized file is never loaded.
            let found = match tokio::fs::metadata(artifact_path).await {
                Ok(meta) => meta.len(),
                Err(e) => return Err(unreadable(e, report)),
            };
            if found != size_bytes {
                return Err(SandboxError::Artifact {
                    message: format!("reported {size_bytes} bytes, found {found}"),
                    report,
                });
            }
            if found > max_artifact_bytes {
                return Err(SandboxError::Oversized {
                    size_bytes: found,
                    limit: max_artifact_bytes,
                    report,
                });
            }
            let artifact = match tokio::fs::read(artifact_path).await {
                Ok(bytes) if bytes.len() as u64 == found => bytes,
                Ok(bytes) => {
                    return Err(SandboxError::Artifact {
                        message: format!("artifact changed size to {} bytes", bytes.len()),
                        report,
                    });
                }
                Err(e) => return Err(unreadable(e, report)),
            };
            Ok(SandboxOutcome::Success {
                artifact,
                page_count: page_count.max(1),
                diagnostics: diagnostics.with_sandbox(Some(report)),
            })
        }
    }
}

/// SIGTERM the process group, wait `kill_grace`, then SIGKILL and reap.
async fn terminate(child: &mut Child, config: &SandboxConfig) -> (Termination, Option<ExitStatus>) {
    if let Ok(Some(status)) = child.try_wait() {
        return (Termination::Exited, Some(status));
    }

    if let Some(pid) = child.id() {
        let group = Pid::from_raw(pid as i32);
        if let Err(e) = killpg(group, Signal::SIGTERM) {
            debug!(pid, error = %e, "SIGTERM failed");
        }
        if let Ok(Ok(status)) = timeout(config.kill_grace, child.wait()).await {
            return (Termination::Terminated, Some(status));
        }
        let _ = killpg(group, Signal::SIGKILL);
    }

    let _ = child.start_kill();
    (Termination::Killed, child.wait().await.ok())
}

fn sandbox_report(
    pid: Option<u32>,
    status: Option<ExitStatus>,
    started: Instant,
    termination: Termination,
) -> SandboxReport {
    SandboxReport {
        pid,
        exit_status: status.map(describe_status),
        wall_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        termination,
    }
}

fn inner_guard_fired(status: ExitStatus) -> bool {
    status.signal() == Some(Signal::SIGALRM as i32)
        || status.code() == Some(i32::from(TIMEOUT_EXIT_CODE))
}

fn describe_status(status: ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exit code {code}"),
        (None, Some(signal)) => format!("signal {signal}"),
        (None, None) => "unknown exit status".to_string(),
    }
}
