//! Bounded external reasoning subprocess.
//!
//! The engine is a black box: prompt in on stdin, UTF-8 text out on stdout,
//! exit 0 on success. The invoker owns the wall-clock bound and the kill
//! escalation; every path returns a value, no panics.

use crate::settings::Settings;
use crate::shutdown::ShutdownToken;
use async_trait::async_trait;
use std::{
    path::PathBuf,
    process::Stdio,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    process::{Child, Command},
};
use tracing::{debug, warn};

#[derive(Debug, Clone, Error)]
pub enum ReasoningError {
    #[error("reasoning timed out after {elapsed_secs}s ({label})")]
    Timeout { label: String, elapsed_secs: u64 },
    #[error("reasoning failed ({label}): {detail}")]
    Failed { label: String, detail: String },
}

#[derive(Debug, Clone)]
pub struct ReasoningRequest {
    pub prompt: String,
    /// Opaque capability allowlist, forwarded on argv.
    pub allowed_capabilities: Vec<String>,
    /// Trace label; also the dry-run sentinel suffix.
    pub label: String,
    pub timeout: Duration,
}

#[async_trait]
pub trait ReasoningInvoker: Send + Sync {
    async fn invoke(
        &self,
        req: ReasoningRequest,
        shutdown: &ShutdownToken,
    ) -> Result<String, ReasoningError>;
}

/// Production binding: spawns the configured engine binary.
pub struct SubprocessInvoker {
    program: String,
    working_dir: PathBuf,
    settings: Settings,
}

const KILL_GRACE: Duration = Duration::from_secs(5);

impl SubprocessInvoker {
    pub fn new(program: String, working_dir: PathBuf, settings: Settings) -> Self {
        Self {
            program,
            working_dir,
            settings,
        }
    }

    /// SIGTERM, five seconds of grace, then SIGKILL.
    async fn terminate(child: &mut Child) {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
                return;
            }
        }
        if let Err(e) = child.kill().await {
            warn!(error = %e, "failed to kill reasoning child");
        }
    }
}

#[async_trait]
impl ReasoningInvoker for SubprocessInvoker {
    async fn invoke(
        &self,
        req: ReasoningRequest,
        shutdown: &ShutdownToken,
    ) -> Result<String, ReasoningError> {
        if self.settings.dry_run_mode().await {
            return Ok(format!("[DRY-RUN] {}", req.label));
        }

        let start = Instant::now();
        let whitelist = self.settings.reasoning_env_whitelist().await;

        let mut cmd = Command::new(&self.program);
        cmd.current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd.arg("--label").arg(&req.label);
        if !req.allowed_capabilities.is_empty() {
            cmd.arg("--allowed-capabilities")
                .arg(req.allowed_capabilities.join(","));
        }
        // SECRET_-prefixed environment never crosses into the child unless
        // explicitly whitelisted.
        for (key, _) in std::env::vars() {
            if key.starts_with("SECRET_") && !whitelist.contains(&key) {
                cmd.env_remove(&key);
            }
        }

        let mut child = cmd.spawn().map_err(|e| ReasoningError::Failed {
            label: req.label.clone(),
            detail: format!("spawn {}: {e}", self.program),
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A fast-exiting child may close the pipe first; its exit status
            // decides the outcome, not the write.
            let _ = stdin.write_all(req.prompt.as_bytes()).await;
            let _ = stdin.shutdown().await;
        }

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let out_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stdout {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });
        let err_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stderr {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });

        let status = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                Self::terminate(&mut child).await;
                return Err(ReasoningError::Failed {
                    label: req.label,
                    detail: "canceled".to_string(),
                });
            }
            res = tokio::time::timeout(req.timeout, child.wait()) => match res {
                Ok(Ok(status)) => Some(status),
                Ok(Err(e)) => {
                    return Err(ReasoningError::Failed {
                        label: req.label,
                        detail: format!("wait: {e}"),
                    });
                }
                Err(_) => None,
            },
        };

        let Some(status) = status else {
            Self::terminate(&mut child).await;
            return Err(ReasoningError::Timeout {
                label: req.label,
                elapsed_secs: start.elapsed().as_secs(),
            });
        };

        let stdout_buf = out_task.await.unwrap_or_default();
        if status.success() {
            debug!(label = %req.label, elapsed_ms = start.elapsed().as_millis() as u64,
                   "reasoning completed");
            return Ok(String::from_utf8_lossy(&stdout_buf).into_owned());
        }

        // stderr is diagnostics only, never parsed.
        let stderr_buf = err_task.await.unwrap_or_default();
        let snippet: String = String::from_utf8_lossy(&stderr_buf)
            .chars()
            .take(400)
            .collect();
        Err(ReasoningError::Failed {
            label: req.label,
            detail: format!("exit {:?}: {}", status.code(), snippet.trim()),
        })
    }
}
