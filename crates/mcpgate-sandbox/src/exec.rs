//! Sandboxed code execution
//!
//! Validates submitted code against a language-specific dangerous-pattern
//! list, assembles the runtime command (Deno or Python) with the limits from
//! the server's sandbox policy, and captures stdout/stderr/exit. The
//! wall-clock cap is enforced here; CPU and memory caps ride on the runtime
//! command line.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

use mcpgate_core::dao::SandboxPolicy;
use mcpgate_core::{GatewayError, GatewayResult};

use crate::session::{RESULTS_DIR, SCRATCH_DIR, SKILLS_DIR, TOOLS_DIR};

/// A shell_exec request.
#[derive(Debug, Deserialize)]
pub struct ExecArgs {
    /// Code to run
    pub code: String,
    /// `python` or `deno`
    pub language: String,
}

/// Patterns refused outright, per language. Network patterns apply only when
/// the policy forbids raw egress.
fn dangerous_patterns(language: &str) -> (&'static [&'static str], &'static [&'static str]) {
    match language {
        "python" => (
            &[
                "os.system",
                "subprocess",
                "__import__",
                "importlib",
                "ctypes",
                "eval(",
                "exec(",
                "os.fork",
                "pty.",
                "shutil.rmtree",
            ],
            &[
                "socket",
                "urllib",
                "http.client",
                "requests",
                "aiohttp",
            ],
        ),
        _ => (
            &[
                "Deno.run",
                "Deno.Command",
                "child_process",
                "eval(",
                "Function(",
                "Deno.removeSync",
                "Deno.remove(",
            ],
            &["fetch(", "XMLHttpRequest", "WebSocket", "Deno.connect"],
        ),
    }
}

/// Screen code for refused constructs before it reaches the runtime.
pub fn validate_code(code: &str, language: &str, policy: &SandboxPolicy) -> GatewayResult<()> {
    let (always, network) = dangerous_patterns(language);
    for pattern in always {
        if code.contains(pattern) {
            return Err(GatewayError::forbidden(format!(
                "code contains refused construct '{pattern}'"
            )));
        }
    }
    if !policy.allow_raw_http {
        for pattern in network {
            if code.contains(pattern) {
                return Err(GatewayError::forbidden(format!(
                    "network egress is disabled for this server ('{pattern}')"
                )));
            }
        }
    }
    Ok(())
}

/// Captured execution outcome.
#[derive(Debug)]
pub struct ExecOutcome {
    /// Process stdout, truncated to the policy's file cap
    pub stdout: String,
    /// Process stderr, truncated to the policy's file cap
    pub stderr: String,
    /// Exit code; -1 when killed
    pub exit_code: i32,
    /// Wall-clock duration
    pub duration_ms: u64,
}

impl ExecOutcome {
    /// JSON shape returned to the caller.
    #[must_use]
    pub fn to_value(&self) -> Value {
        json!({
            "stdout": self.stdout,
            "stderr": self.stderr,
            "exit_code": self.exit_code,
            "duration_ms": self.duration_ms,
        })
    }
}

/// Run validated code inside the session root under the policy's limits.
pub async fn run_code(
    root: &Path,
    args: &ExecArgs,
    policy: &SandboxPolicy,
) -> GatewayResult<ExecOutcome> {
    validate_code(&args.code, &args.language, policy)?;

    let extension = if args.language == "python" { "py" } else { "ts" };
    let job_file = root
        .join(SCRATCH_DIR)
        .join(format!("job-{}.{extension}", Uuid::new_v4()));
    tokio::fs::write(&job_file, &args.code)
        .await
        .map_err(|e| GatewayError::internal(format!("job write: {e}")))?;

    let mut command = build_command(root, &job_file, &args.language, policy);
    command
        .current_dir(root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let started = Instant::now();
    let wall_clock = Duration::from_secs(policy.wall_clock_seconds);
    let child = command
        .spawn()
        .map_err(|e| GatewayError::internal(format!("sandbox spawn: {e}")))?;

    let output = match tokio::time::timeout(wall_clock, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(GatewayError::internal(format!("sandbox wait: {e}"))),
        Err(_) => {
            warn!(job = %job_file.display(), "sandbox job exceeded wall clock; killed");
            let _ = tokio::fs::remove_file(&job_file).await;
            return Err(GatewayError::timeout(
                "sandbox wall clock",
                wall_clock.as_millis() as u64,
            ));
        }
    };
    let _ = tokio::fs::remove_file(&job_file).await;

    let cap = policy.max_file_bytes as usize;
    let outcome = ExecOutcome {
        stdout: truncated(&output.stdout, cap),
        stderr: truncated(&output.stderr, cap),
        exit_code: output.status.code().unwrap_or(-1),
        duration_ms: started.elapsed().as_millis() as u64,
    };
    debug!(
        exit = outcome.exit_code,
        duration_ms = outcome.duration_ms,
        "sandbox job finished"
    );
    Ok(outcome)
}

/// Assemble the runtime command with policy limits on the command line.
fn build_command(
    root: &Path,
    job_file: &Path,
    language: &str,
    policy: &SandboxPolicy,
) -> tokio::process::Command {
    let scratch = root.join(SCRATCH_DIR);
    let results = root.join(RESULTS_DIR);
    let tools = root.join(TOOLS_DIR);
    let skills = root.join(SKILLS_DIR);

    if language == "python" {
        let mut command = tokio::process::Command::new("python3");
        command
            .arg("-I") // isolated mode: no site-packages, no env injection
            .arg(job_file)
            .env_clear()
            .env("MCPGATE_SESSION_ROOT", root)
            .env("MCPGATE_CPU_SECONDS", policy.cpu_seconds.to_string())
            .env("MCPGATE_MEMORY_BYTES", policy.memory_bytes.to_string());
        command
    } else {
        let mut command = tokio::process::Command::new("deno");
        command
            .arg("run")
            .arg("--no-prompt")
            .arg(format!(
                "--allow-read={},{},{},{}",
                tools.display(),
                skills.display(),
                scratch.display(),
                results.display()
            ))
            .arg(format!(
                "--allow-write={},{}",
                scratch.display(),
                results.display()
            ))
            .arg(format!(
                "--v8-flags=--max-old-space-size={}",
                policy.memory_bytes / (1024 * 1024)
            ));
        if policy.allow_raw_http {
            command.arg("--allow-net");
        }
        command.arg(job_file);
        command
    }
}

fn truncated(bytes: &[u8], cap: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= cap {
        return text.into_owned();
    }
    let mut end = cap;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…[truncated]", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dangerous_python_is_refused() {
        let policy = SandboxPolicy::default();
        assert!(validate_code("print('hi')", "python", &policy).is_ok());
        for bad in [
            "import subprocess; subprocess.run(['ls'])",
            "os.system('rm -rf /')",
            "eval(input())",
            "__import__('os')",
        ] {
            assert!(validate_code(bad, "python", &policy).is_err(), "{bad}");
        }
    }

    #[test]
    fn network_patterns_gate_on_allow_raw_http() {
        let mut policy = SandboxPolicy::default();
        assert!(validate_code("import urllib.request", "python", &policy).is_err());
        policy.allow_raw_http = true;
        assert!(validate_code("import urllib.request", "python", &policy).is_ok());

        policy.allow_raw_http = false;
        assert!(validate_code("await fetch('https://x')", "deno", &policy).is_err());
        policy.allow_raw_http = true;
        assert!(validate_code("await fetch('https://x')", "deno", &policy).is_ok());
    }

    #[test]
    fn deno_escape_hatches_are_always_refused() {
        let policy = SandboxPolicy {
            allow_raw_http: true,
            ..SandboxPolicy::default()
        };
        assert!(validate_code("Deno.Command('sh')", "deno", &policy).is_err());
        assert!(validate_code("eval('1+1')", "deno", &policy).is_err());
    }

    #[test]
    fn output_truncation_respects_cap() {
        assert_eq!(truncated(b"hello", 10), "hello");
        assert_eq!(truncated(b"hello world", 5), "hello…[truncated]");
    }
}
