//! Subprocess wrapper for the sky CLI.
//!
//! Two execution modes: full capture for quick queries (status, check) and
//! line streaming for long operations (launch) where progress should be
//! forwarded as it happens. Spawn failures are folded into a synthetic
//! non-zero [`RunResult`] so callers only deal with one failure shape.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::paths;

/// Captured outcome of a finished sky invocation.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    fn spawn_failure(binary: &Path, err: &std::io::Error) -> Self {
        Self {
            exit_code: 1,
            stdout: String::new(),
            stderr: format!("failed to run {}: {err}", binary.display()),
        }
    }
}

/// Runs sky commands against the managed binary, falling back to a
/// system-wide `sky` on PATH when the managed one is absent.
pub struct SkyRunner {
    managed_bin: PathBuf,
}

impl SkyRunner {
    pub fn new(carapace_home: &Path) -> Self {
        Self {
            managed_bin: paths::sky_binary_path(carapace_home),
        }
    }

    /// The binary this runner will invoke right now. Resolved per call so a
    /// just-finished install is picked up without restarting.
    pub fn resolve_binary(&self) -> PathBuf {
        if self.managed_bin.exists() {
            return self.managed_bin.clone();
        }
        which::which("sky").unwrap_or_else(|_| self.managed_bin.clone())
    }

    /// Run to completion, capturing stdout and stderr.
    pub async fn run(&self, args: &[&str]) -> RunResult {
        let binary = self.resolve_binary();
        debug!(binary = %binary.display(), ?args, "running sky");
        let output = match Command::new(&binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
        {
            Ok(out) => out,
            Err(e) => {
                warn!(binary = %binary.display(), error = %e, "sky spawn failed");
                return RunResult::spawn_failure(&binary, &e);
            }
        };
        RunResult {
            exit_code: output.status.code().unwrap_or(1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }

    /// Run while forwarding each stdout line to `on_line`. Stderr is
    /// captured in full for error classification after exit.
    pub async fn run_streaming(
        &self,
        args: &[&str],
        mut on_line: impl FnMut(&str),
    ) -> RunResult {
        let binary = self.resolve_binary();
        debug!(binary = %binary.display(), ?args, "running sky (streaming)");
        let mut child = match Command::new(&binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!(binary = %binary.display(), error = %e, "sky spawn failed");
                return RunResult::spawn_failure(&binary, &e);
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stderr_task = tokio::spawn(async move {
            let mut collected = String::new();
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    collected.push_str(&line);
                    collected.push('\n');
                }
            }
            collected
        });

        let mut stdout_text = String::new();
        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                on_line(&line);
                stdout_text.push_str(&line);
                stdout_text.push('\n');
            }
        }

        let status = child.wait().await;
        let stderr_text = stderr_task.await.unwrap_or_default();
        let exit_code = match status {
            Ok(status) => status.code().unwrap_or(1),
            Err(_) => 1,
        };
        RunResult {
            exit_code,
            stdout: stdout_text,
            stderr: stderr_text,
        }
    }

    // ── Command wrappers ─────────────────────────────────────────────

    pub async fn launch(&self, yaml_path: &Path, cluster_name: &str, on_line: impl FnMut(&str)) -> RunResult {
        let yaml = yaml_path.to_string_lossy();
        self.run_streaming(&["launch", "-c", cluster_name, "-y", &yaml], on_line)
            .await
    }

    pub async fn stop_cluster(&self, cluster_name: &str) -> RunResult {
        self.run(&["stop", cluster_name, "-y"]).await
    }

    pub async fn down(&self, cluster_name: &str) -> RunResult {
        self.run(&["down", cluster_name, "-y"]).await
    }

    pub async fn status(&self, cluster_name: &str) -> RunResult {
        self.run(&["status", cluster_name, "--refresh"]).await
    }

    pub async fn check(&self) -> RunResult {
        self.run(&["check"]).await
    }

    /// Query the head node IP. `None` when the command fails or prints
    /// nothing usable.
    pub async fn ip(&self, cluster_name: &str) -> Option<String> {
        let result = self.run(&["status", cluster_name, "--ip"]).await;
        if !result.success() {
            return None;
        }
        let ip = result.stdout.trim();
        if ip.is_empty() {
            return None;
        }
        Some(ip.to_string())
    }
}
