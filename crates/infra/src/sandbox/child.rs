//! Child side of the sandbox: read one request, run the pipeline, report once.

use std::io::{self, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, info_span, warn};

use folio_engine::{DocumentCompiler, DocumentRenderer};

use super::pipeline::run_pipeline;
use super::{FailureKind, SandboxReply, SandboxRequest};
use crate::jobs::Diagnostics;

/// Exit code used when the inner wall-clock guard fires.
pub const TIMEOUT_EXIT_CODE: u8 = 124;
const FAILURE_EXIT_CODE: u8 = 1;
const PROTOCOL_EXIT_CODE: u8 = 2;

/// Writes the result line at most once per process.
struct Reporter {
    sent: AtomicBool,
    out: Mutex<Box<dyn Write + Send>>,
}

impl Reporter {
    fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            sent: AtomicBool::new(false),
            out: Mutex::new(out),
        }
    }

    /// Returns `false` if a result was already reported.
    fn send(&self, reply: &SandboxReply) -> bool {
        if self.sent.swap(true, Ordering::SeqCst) {
            return false;
        }

        let line = serde_json::to_string(reply).or_else(|e| {
            serde_json::to_string(&SandboxReply::Failure {
                kind: FailureKind::Unknown,
                error: format!("failed to serialize sandbox result: {e}"),
                diagnostics: Diagnostics::default(),
            })
        });
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "cannot serialize any sandbox result");
                return true;
            }
        };

        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(out, "{line}").and_then(|_| out.flush()) {
            error!(error = %e, "failed to write sandbox result");
        }
        true
    }

    fn fail(&self, kind: FailureKind, error: impl Into<String>, diagnostics: Diagnostics) -> bool {
        self.send(&SandboxReply::Failure {
            kind,
            error: error.into(),
            diagnostics,
        })
    }
}

/// Process-level guards around one pipeline run.
#[derive(Debug, Clone, Copy)]
struct Guards {
    /// Arm the kernel alarm backstop.
    alarm: bool,
    /// Called by the watchdog after it reported the timeout.
    on_expired: fn(),
}

fn exit_on_timeout() {
    std::process::exit(i32::from(TIMEOUT_EXIT_CODE));
}

/// Run the sandbox child protocol on stdin/stdout.
///
/// Guards, in order of installation:
/// 1. a watchdog thread that reports `Failure{timeout}` after the job's
///    timeout, with whatever diagnostics were gathered, and exits;
/// 2. a kernel alarm one second later whose default action kills the process
///    even if the watchdog never gets scheduled;
/// 3. an optional address-space limit.
pub fn run_child(compiler: &dyn DocumentCompiler, renderer: &dyn DocumentRenderer) -> ExitCode {
    let reporter = Arc::new(Reporter::new(Box::new(io::stdout())));
    let guards = Guards {
        alarm: true,
        on_expired: exit_on_timeout,
    };
    ExitCode::from(serve(io::stdin().lock(), reporter, compiler, renderer, guards))
}

fn serve(
    input: impl Read,
    reporter: Arc<Reporter>,
    compiler: &dyn DocumentCompiler,
    renderer: &dyn DocumentRenderer,
    guards: Guards,
) -> u8 {
    let request = match read_request(input) {
        Ok(request) => request,
        Err(message) => {
            error!(error = %message, "invalid sandbox request");
            reporter.fail(FailureKind::Unknown, message, Diagnostics::default());
            return PROTOCOL_EXIT_CODE;
        }
    };

    let span = info_span!("sandbox", job_id = %request.job_id);
    let _enter = span.enter();

    let timeout = Duration::from_millis(request.timeout_ms);
    let diagnostics = Arc::new(Mutex::new(Diagnostics::default()));
    arm_watchdog(
        timeout,
        Arc::clone(&reporter),
        Arc::clone(&diagnostics),
        guards.on_expired,
    );
    if guards.alarm {
        arm_alarm(timeout);
    }

    if let Some(limit) = request.memory_limit_bytes {
        if let Err(e) = limit_address_space(limit) {
            warn!(error = %e, limit, "failed to apply address-space limit");
        }
    }

    info!(timeout_ms = request.timeout_ms, "sandbox pipeline starting");
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        run_pipeline(
            &request.source,
            &request.options,
            compiler,
            renderer,
            &diagnostics,
        )
    }));
    let snapshot = || {
        diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    };

    // The watchdog is the only other sender; losing the race means timeout.
    let (reply, code) = match result {
        Ok(Ok(artifact)) => {
            if let Err(e) = std::fs::write(&request.artifact_path, &artifact.bytes) {
                let failure = SandboxReply::Failure {
                    kind: FailureKind::Unknown,
                    error: format!("failed to write artifact: {e}"),
                    diagnostics: snapshot(),
                };
                (failure, FAILURE_EXIT_CODE)
            } else {
                let success = SandboxReply::Success {
                    page_count: artifact.page_count,
                    size_bytes: artifact.bytes.len() as u64,
                    diagnostics: snapshot(),
                };
                (success, 0)
            }
        }
        Ok(Err(failure)) => {
            info!(kind = failure.kind.as_str(), error = %failure.error, "pipeline failed");
            let reply = SandboxReply::Failure {
                kind: failure.kind,
                error: failure.error,
                diagnostics: snapshot(),
            };
            (reply, FAILURE_EXIT_CODE)
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(panic = %message, "engine panicked");
            let reply = SandboxReply::Failure {
                kind: FailureKind::Unknown,
                error: format!("engine panicked: {message}"),
                diagnostics: snapshot(),
            };
            (reply, FAILURE_EXIT_CODE)
        }
    };

    if reporter.send(&reply) {
        code
    } else {
        TIMEOUT_EXIT_CODE
    }
}

fn read_request(mut input: impl Read) -> Result<SandboxRequest, String> {
    let mut raw = String::new();
    input
        .read_to_string(&mut raw)
        .map_err(|e| format!("failed to read sandbox request: {e}"))?;
    serde_json::from_str(&raw).map_err(|e| format!("failed to parse sandbox request: {e}"))
}

fn arm_watchdog(
    timeout: Duration,
    reporter: Arc<Reporter>,
    diagnostics: Arc<Mutex<Diagnostics>>,
    on_expired: fn(),
) {
    let spawned = thread::Builder::new()
        .name("sandbox-watchdog".to_string())
        .spawn(move || {
            thread::sleep(timeout);

            let message = format!("exceeded the {} ms wall-clock budget", timeout.as_millis());
            let mut snapshot = diagnostics
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            let now = Utc::now();
            for phase in [&mut snapshot.compile, &mut snapshot.render] {
                if phase.is_running() {
                    phase.fail(now, message.clone());
                }
            }

            // The pipeline may have reported in the meantime; then it owns the exit.
            if reporter.fail(FailureKind::Timeout, message, snapshot) {
                warn!("wall-clock budget exhausted; exiting");
                on_expired();
            }
        });

    if let Err(e) = spawned {
        warn!(error = %e, "failed to start watchdog; relying on alarm");
    }
}

fn arm_alarm(timeout: Duration) {
    let secs = timeout
        .as_secs()
        .saturating_add(u64::from(timeout.subsec_nanos() > 0))
        .saturating_add(1);
    let _ = nix::unistd::alarm::set(u32::try_from(secs).unwrap_or(u32::MAX));
}

#[cfg(target_os = "linux")]
fn limit_address_space(bytes: u64) -> nix::Result<()> {
    use nix::sys::resource::{setrlimit, Resource};
    setrlimit(Resource::RLIMIT_AS, bytes, bytes)
}

#[cfg(not(target_os = "linux"))]
fn limit_address_space(_bytes: u64) -> nix::Result<()> {
    Ok(())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
