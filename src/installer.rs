//! Idempotent toolchain installer.
//!
//! Installs the uv package manager and the SkyPilot CLI under the managed
//! `~/.carapace/` root. Concurrent calls coalesce onto one in-flight
//! install: the first caller drives the work and receives every progress
//! update, later callers get a "waiting" notice and the shared outcome.
//! A failed attempt clears the slot so the next call starts fresh.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;

use futures_util::future::{BoxFuture, Shared};
use futures_util::{FutureExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::GatekeeperError;
use crate::paths;

/// Package installed into the managed tool environment.
const SKYPILOT_PACKAGE: &str = "skypilot-nightly[aws]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallPhase {
    Checking,
    DownloadingUv,
    Installing,
    Verifying,
    Complete,
}

impl InstallPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            InstallPhase::Checking => "checking",
            InstallPhase::DownloadingUv => "downloading_uv",
            InstallPhase::Installing => "installing",
            InstallPhase::Verifying => "verifying",
            InstallPhase::Complete => "complete",
        }
    }
}

/// One progress update from an in-flight install.
#[derive(Debug, Clone)]
pub struct InstallProgress {
    pub phase: InstallPhase,
    pub message: String,
    /// Only meaningful during the uv download.
    pub percent: Option<u8>,
}

impl InstallProgress {
    fn new(phase: InstallPhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            percent: None,
        }
    }
}

/// Snapshot of what is currently installed under the managed root.
#[derive(Debug, Clone)]
pub struct InstallStatus {
    pub uv_installed: bool,
    pub uv_version: Option<String>,
    pub sky_installed: bool,
    pub sky_version: Option<String>,
    pub carapace_home: String,
}

type ProgressFn = Box<dyn FnMut(InstallProgress) + Send>;
type InstallFuture = Shared<BoxFuture<'static, Result<PathBuf, String>>>;

pub struct Installer {
    home: PathBuf,
    inflight: Mutex<Option<InstallFuture>>,
}

impl Installer {
    pub fn new(carapace_home: &Path) -> Self {
        Self {
            home: carapace_home.to_path_buf(),
            inflight: Mutex::new(None),
        }
    }

    /// Ensure the sky CLI is installed, returning its path.
    ///
    /// Exactly one install runs at a time; callers that arrive while one is
    /// in flight await its result instead of starting another.
    pub async fn ensure<F>(&self, on_progress: F) -> Result<PathBuf, GatekeeperError>
    where
        F: FnMut(InstallProgress) + Send + 'static,
    {
        let mut on_progress = Some(on_progress);
        let fut = {
            let mut slot = self.inflight.lock().unwrap();
            match slot.as_ref() {
                Some(existing) => existing.clone(),
                None => {
                    let cb: ProgressFn = match on_progress.take() {
                        Some(f) => Box::new(f),
                        None => Box::new(|_| {}),
                    };
                    let fut = install_flow(self.home.clone(), cb).boxed().shared();
                    *slot = Some(fut.clone());
                    fut
                }
            }
        };
        // Still holding the callback means we joined an existing install.
        if let Some(cb) = on_progress.as_mut() {
            cb(InstallProgress::new(
                InstallPhase::Checking,
                "Installation already in progress, waiting...",
            ));
        }

        let result = fut.clone().await;

        // Clear the slot, but only if it still holds *our* install — a
        // fresh attempt may already have replaced it.
        {
            let mut slot = self.inflight.lock().unwrap();
            if slot.as_ref().is_some_and(|f| f.ptr_eq(&fut)) {
                *slot = None;
            }
        }

        result.map_err(|message| GatekeeperError::Install { message })
    }

    /// Report what is currently installed without changing anything.
    pub async fn install_status(&self) -> InstallStatus {
        let uv = paths::uv_binary_path(&self.home);
        let sky = paths::sky_binary_path(&self.home);
        let uv_installed = uv.exists();
        let sky_installed = sky.exists();

        let uv_version = if uv_installed {
            query_uv_version(&uv).await
        } else {
            None
        };

        InstallStatus {
            uv_installed,
            uv_version,
            sky_installed,
            sky_version: sky_installed.then(|| "installed".to_string()),
            carapace_home: self.home.display().to_string(),
        }
    }
}

async fn query_uv_version(uv: &Path) -> Option<String> {
    let output = Command::new(uv)
        .arg("--version")
        .stdin(Stdio::null())
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let version = stdout.trim().strip_prefix("uv ").unwrap_or(stdout.trim());
    Some(version.split_whitespace().next()?.to_string())
}

/// The actual install sequence. Errors are strings so the shared future's
/// output stays cheaply cloneable.
async fn install_flow(home: PathBuf, mut progress: ProgressFn) -> Result<PathBuf, String> {
    progress(InstallProgress::new(
        InstallPhase::Checking,
        "Checking for existing installation...",
    ));

    let sky = paths::sky_binary_path(&home);
    if sky.exists() {
        info!(path = %sky.display(), "sky already installed");
        progress(InstallProgress {
            phase: InstallPhase::Complete,
            message: "SkyPilot already installed".into(),
            percent: Some(100),
        });
        return Ok(sky);
    }

    let uv = paths::uv_binary_path(&home);
    if !uv.exists() {
        download_uv(&home, &mut progress).await?;
    }

    progress(InstallProgress::new(
        InstallPhase::Installing,
        "Installing SkyPilot...",
    ));
    for dir in [
        paths::uv_tool_bin_dir(&home),
        paths::uv_tool_dir(&home),
        paths::uv_python_dir(&home),
    ] {
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| format!("failed to create {}: {e}", dir.display()))?;
    }
    run_uv_install(&uv, &home, &mut progress).await?;

    progress(InstallProgress::new(
        InstallPhase::Verifying,
        "Verifying installation...",
    ));
    if !sky.exists() {
        return Err(format!(
            "sky binary not found at {} after install",
            sky.display()
        ));
    }

    info!(path = %sky.display(), "sky installed");
    progress(InstallProgress {
        phase: InstallPhase::Complete,
        message: "SkyPilot installed successfully".into(),
        percent: Some(100),
    });
    Ok(sky)
}

/// Download the uv release tarball and unpack the binary into
/// `<home>/uv/bin/`.
async fn download_uv(home: &Path, progress: &mut ProgressFn) -> Result<(), String> {
    let arch = if std::env::consts::ARCH == "aarch64" {
        "aarch64"
    } else {
        "x86_64"
    };
    let os = if std::env::consts::OS == "macos" {
        "apple-darwin"
    } else {
        "unknown-linux-gnu"
    };
    let url = format!(
        "https://github.com/astral-sh/uv/releases/latest/download/uv-{arch}-{os}.tar.gz"
    );

    progress(InstallProgress::new(
        InstallPhase::DownloadingUv,
        "Downloading uv package manager...",
    ));

    let bin_dir = home.join("uv").join("bin");
    tokio::fs::create_dir_all(&bin_dir)
        .await
        .map_err(|e| format!("failed to create {}: {e}", bin_dir.display()))?;
    let tarball = bin_dir.join("uv.tar.gz.part");

    let response = reqwest::get(&url)
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| format!("uv download failed: {e}"))?;
    let total = response.content_length();

    let mut file = tokio::fs::File::create(&tarball)
        .await
        .map_err(|e| format!("failed to create {}: {e}", tarball.display()))?;
    let mut stream = response.bytes_stream();
    let mut downloaded: u64 = 0;
    let mut last_percent: u8 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| format!("uv download failed: {e}"))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| format!("failed to write {}: {e}", tarball.display()))?;
        downloaded += chunk.len() as u64;
        if let Some(total) = total
            && total > 0
        {
            let percent = ((downloaded * 100) / total).min(100) as u8;
            if percent != last_percent {
                last_percent = percent;
                progress(InstallProgress {
                    phase: InstallPhase::DownloadingUv,
                    message: "Downloading uv package manager...".into(),
                    percent: Some(percent),
                });
            }
        }
    }
    file.flush()
        .await
        .map_err(|e| format!("failed to write {}: {e}", tarball.display()))?;
    drop(file);

    // Tarball layout is uv-<target>/uv, so strip the top-level directory.
    let output = Command::new("tar")
        .arg("xzf")
        .arg(&tarball)
        .arg("--strip-components=1")
        .arg("-C")
        .arg(&bin_dir)
        .output()
        .await
        .map_err(|e| format!("failed to run tar: {e}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("uv extraction failed: {}", stderr.trim()));
    }

    let uv = paths::uv_binary_path(home);
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&uv, std::fs::Permissions::from_mode(0o755))
            .await
            .map_err(|e| format!("failed to chmod {}: {e}", uv.display()))?;
    }

    if let Err(e) = tokio::fs::remove_file(&tarball).await {
        warn!(path = %tarball.display(), error = %e, "failed to remove tarball");
    }
    Ok(())
}

/// Run `uv tool install` with writes redirected under the managed root,
/// streaming stdout lines as progress.
async fn run_uv_install(
    uv: &Path,
    home: &Path,
    progress: &mut ProgressFn,
) -> Result<(), String> {
    let mut command = Command::new(uv);
    command
        .arg("tool")
        .arg("install")
        .arg(SKYPILOT_PACKAGE)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in paths::uv_env(home) {
        command.env(key, value);
    }

    let mut child = command
        .spawn()
        .map_err(|e| format!("failed to run {}: {e}", uv.display()))?;

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

    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if !line.is_empty() {
                progress(InstallProgress::new(InstallPhase::Installing, line));
            }
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| format!("failed to wait for uv: {e}"))?;
    let stderr_text = stderr_task.await.unwrap_or_default();

    if !status.success() {
        for line in stderr_text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            progress(InstallProgress::new(InstallPhase::Installing, line));
        }
        let code = status.code().unwrap_or(1);
        let detail = stderr_text
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("unknown error");
        return Err(format!("SkyPilot installation failed (exit {code}): {detail}"));
    }
    Ok(())
}
