//! End-to-end runs of the `folio-worker` binary, sandbox child included.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use serde_json::Value;

const BIN: &str = env!("CARGO_BIN_EXE_folio-worker");

fn worker(root: &Path) -> Command {
    let mut cmd = Command::new(BIN);
    cmd.env("FOLIO_STORAGE_ROOT", root)
        .env("RUST_LOG", "warn")
        .env_remove("DATABASE_URL")
        .env_remove("FOLIO_SANDBOX_PROGRAM")
        .env_remove("FOLIO_MAX_PAGES")
        .env_remove("FOLIO_RENDER_TIMEOUT_SECS");
    cmd
}

fn job_record(output: &Output) -> Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(&stdout).unwrap_or_else(|e| {
        panic!(
            "stdout is not a job record ({e}):\n{stdout}\nstderr:\n{}",
            String::from_utf8_lossy(&output.stderr)
        )
    })
}

fn count_files(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() { count_files(&path) } else { 1 }
        })
        .sum()
}

#[test]
fn inline_document_renders_through_the_sandbox() {
    let dir = tempfile::tempdir().unwrap();
    let doc = dir.path().join("notes.txt");
    std::fs::write(&doc, "first page\u{000C}second page").unwrap();
    let pdf = dir.path().join("out.pdf");
    let root = dir.path().join("data");

    let output = worker(&root)
        .args(["render", "--deterministic", "--inline"])
        .arg(&doc)
        .arg("-o")
        .arg(&pdf)
        .output()
        .unwrap();

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let job = job_record(&output);
    assert_eq!(job["status"], "completed");
    assert_eq!(job["page_count"], 2);
    assert!(job["output_ref"].as_str().unwrap().starts_with("jobs/"));

    let bytes = std::fs::read(&pdf).unwrap();
    assert!(bytes.starts_with(b"%PDF"));
    assert_eq!(job["size_bytes"], bytes.len() as u64);

    let diagnostics = &job["diagnostics"];
    assert_eq!(diagnostics["compile"]["stats"]["source"], "inline");
    assert!(diagnostics["render"]["completed_at"].is_string());
    assert_eq!(diagnostics["sandbox"]["termination"], "exited");
    assert!(!root.join("scratch").exists() || count_files(&root.join("scratch")) == 0);
}

#[test]
fn project_render_hands_the_artifact_to_the_project() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let owner = "0190a6f4-1c2b-7d3e-8f40-5a6b7c8d9e0f";
    let project = "0190a6f4-1c2b-7d3e-8f40-5a6b7c8d9e10";
    let source = root.join("projects").join(owner).join(project).join("source");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::write(source.join("01-intro.md"), "# Report\nhello").unwrap();
    std::fs::write(source.join("02-body.txt"), "\u{000C}body").unwrap();

    let output = worker(root)
        .args(["render", "--project", project, "--owner", owner])
        .output()
        .unwrap();

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let job = job_record(&output);
    assert_eq!(job["status"], "completed");
    assert!(job["output_ref"].is_null());
    assert_eq!(job["page_count"], 2);

    let compiled = root
        .join("projects")
        .join(owner)
        .join(project)
        .join("compiled")
        .join("output.pdf");
    assert!(std::fs::read(compiled).unwrap().starts_with(b"%PDF"));
    assert_eq!(count_files(&root.join("jobs")), 0);
}

#[test]
fn empty_project_fails_in_the_compile_phase() {
    let dir = tempfile::tempdir().unwrap();
    let owner = "0190a6f4-1c2b-7d3e-8f40-5a6b7c8d9e0f";
    let project = "0190a6f4-1c2b-7d3e-8f40-5a6b7c8d9e11";

    let output = worker(dir.path())
        .args(["render", "--project", project, "--owner", owner])
        .output()
        .unwrap();

    assert!(!output.status.success());
    let job = job_record(&output);
    assert_eq!(job["status"], "failed");
    assert_eq!(job["diagnostics"]["error_kind"], "compile");
    assert!(job["diagnostics"]["render"]["started_at"].is_null());
    assert!(job["size_bytes"].is_null());
}

#[test]
fn strict_mode_turns_warnings_into_render_failures() {
    let dir = tempfile::tempdir().unwrap();
    let doc = dir.path().join("accents.txt");
    std::fs::write(&doc, "caf\u{e9}").unwrap();

    let output = worker(&dir.path().join("data"))
        .args(["render", "--strict", "--inline"])
        .arg(&doc)
        .output()
        .unwrap();

    let job = job_record(&output);
    assert_eq!(job["status"], "failed");
    assert_eq!(job["diagnostics"]["error_kind"], "render");
}

#[test]
fn page_budget_discards_the_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let doc = dir.path().join("long.txt");
    std::fs::write(&doc, "one\u{000C}two\u{000C}three").unwrap();
    let root = dir.path().join("data");

    let output = worker(&root)
        .args(["render", "--max-pages", "2", "--inline"])
        .arg(&doc)
        .output()
        .unwrap();

    let job = job_record(&output);
    assert_eq!(job["status"], "failed");
    assert_eq!(job["error_message"], "rendered 3 pages, limit is 2");
    assert_eq!(job["diagnostics"]["error_kind"], "budget_exceeded");
    assert_eq!(count_files(&root), 0);
}

#[test]
fn unresponsive_sandbox_is_stopped_and_recorded_as_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("stuck-sandbox.sh");
    std::fs::write(&script, "#!/bin/sh\ntrap '' TERM\nwhile :; do sleep 1; done\n").unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    let doc = dir.path().join("doc.txt");
    std::fs::write(&doc, "text").unwrap();

    let output = worker(&dir.path().join("data"))
        .env("FOLIO_SANDBOX_GRACE_SECS", "1")
        .env("FOLIO_KILL_GRACE_SECS", "1")
        .args(["render", "--timeout-secs", "1", "--sandbox-program"])
        .arg(&script)
        .arg("--inline")
        .arg(&doc)
        .output()
        .unwrap();

    let job = job_record(&output);
    assert_eq!(job["status"], "failed");
    let diagnostics = &job["diagnostics"];
    assert_eq!(diagnostics["error_kind"], "timeout");
    assert_eq!(diagnostics["sandbox"]["termination"], "killed");

    let pid = diagnostics["sandbox"]["pid"].as_u64().unwrap();
    assert!(!Path::new(&format!("/proc/{pid}")).exists());
}

#[test]
fn sandbox_ended_by_its_own_alarm_is_recorded_as_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("alarmed-sandbox.sh");
    std::fs::write(&script, "#!/bin/sh\ncat >/dev/null\nkill -ALRM $$\n").unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    let doc = dir.path().join("doc.txt");
    std::fs::write(&doc, "text").unwrap();

    let output = worker(&dir.path().join("data"))
        .arg("render")
        .arg("--sandbox-program")
        .arg(&script)
        .arg("--inline")
        .arg(&doc)
        .output()
        .unwrap();

    let job = job_record(&output);
    assert_eq!(job["status"], "failed");
    assert_eq!(job["diagnostics"]["error_kind"], "timeout");
    assert_eq!(job["diagnostics"]["sandbox"]["exit_status"], "signal 14");
}

#[test]
fn sandbox_child_speaks_the_line_protocol() {
    let dir = tempfile::tempdir().unwrap();
    let artifact = dir.path().join("artifact.bin");
    let request = serde_json::json!({
        "job_id": "0190a6f4-1c2b-7d3e-8f40-5a6b7c8d9e12",
        "source": {"inline": {"document": {"title": "t", "pages": ["a", "b", "c"]}}},
        "options": {"profile": "letter", "deterministic": true},
        "timeout_ms": 10_000,
        "artifact_path": artifact,
    });

    let mut child = Command::new(BIN)
        .arg("sandbox")
        .env("RUST_LOG", "debug")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    child
        .stdin
        .take()
        .unwrap()
        .write_all(request.to_string().as_bytes())
        .unwrap();

    let mut lines = BufReader::new(child.stdout.take().unwrap()).lines();
    let reply: Value = serde_json::from_str(&lines.next().unwrap().unwrap()).unwrap();
    assert!(lines.next().is_none(), "exactly one result line");
    assert!(child.wait().unwrap().success());

    assert_eq!(reply["outcome"], "success");
    assert_eq!(reply["page_count"], 3);
    let bytes = std::fs::read(&artifact).unwrap();
    assert_eq!(reply["size_bytes"], bytes.len() as u64);
}

#[test]
fn malformed_request_is_reported_not_crashed() {
    let mut child = Command::new(BIN)
        .arg("sandbox")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    child.stdin.take().unwrap().write_all(b"{not json").unwrap();

    let output = child.wait_with_output().unwrap();
    assert_eq!(output.status.code(), Some(2));
    let reply: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(reply["outcome"], "failure");
    assert_eq!(reply["kind"], "unknown");
}

#[test]
fn single_sweep_pass_reports_counts() {
    let dir = tempfile::tempdir().unwrap();
    let output = worker(dir.path())
        .env("FOLIO_SANDBOX_PROGRAM", "/bin/true")
        .args(["sweep", "--once", "--retention-hours", "24"])
        .output()
        .unwrap();

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    let report: Value = serde_json::from_str(stdout.lines().last().unwrap()).unwrap();
    assert_eq!(report["examined"], 0);
    assert_eq!(report["deleted"], 0);
}
