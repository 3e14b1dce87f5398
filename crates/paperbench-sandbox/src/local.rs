use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::process::Command;

use crate::{ExecOutput, LeaseFailure, SandboxConfig, SandboxError, SandboxHandle, SandboxRuntime};

/// A "sandbox" backed by a host subprocess confined to a per-lease temp
/// directory. Used for local development and the workspace's own test
/// suite in place of a real container runtime, mirroring the teacher's
/// own local-dev shell execution path rather than driving a production
/// container driver (out of scope, per spec.md §1).
pub struct LocalProcessRuntime;

impl LocalProcessRuntime {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LocalProcessRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxRuntime for LocalProcessRuntime {
    async fn lease_once(&self, config: &SandboxConfig) -> Result<Box<dyn SandboxHandle>, LeaseFailure> {
        let dir = tempfile::tempdir().map_err(|e| LeaseFailure {
            kind: "transient".to_string(),
            message: e.to_string(),
        })?;
        tracing::debug!(image = %config.docker_image, dir = %dir.path().display(), "leased local sandbox");
        Ok(Box::new(LocalSandboxHandle {
            dir,
            environment: config.environment.clone(),
            internet_disabled: AtomicBool::new(config.network_mode == paperbench_types::NetworkMode::None),
            stopped: AtomicBool::new(false),
        }))
    }
}

struct LocalSandboxHandle {
    dir: tempfile::TempDir,
    environment: std::collections::HashMap<String, String>,
    internet_disabled: AtomicBool,
    stopped: AtomicBool,
}

impl LocalSandboxHandle {
    fn resolve(&self, path: &str) -> PathBuf {
        let trimmed = path.trim_start_matches('/');
        self.dir.path().join(trimmed)
    }
}

#[async_trait]
impl SandboxHandle for LocalSandboxHandle {
    async fn exec(&self, cmd: &str, _idempotent: bool) -> Result<ExecOutput, SandboxError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SandboxError::Released);
        }
        let mut command = Command::new("sh");
        command.arg("-c").arg(cmd).current_dir(self.dir.path());
        for (k, v) in &self.environment {
            command.env(k, v);
        }
        if self.internet_disabled.load(Ordering::SeqCst) {
            command.env("http_proxy", "http://127.0.0.1:1").env("https_proxy", "http://127.0.0.1:1");
        }
        let output = command
            .output()
            .await
            .map_err(|e| SandboxError::OpError(e.to_string()))?;

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        Ok(ExecOutput {
            combined_output: combined,
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn upload(&self, bytes: &[u8], dest_path: &str) -> Result<(), SandboxError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SandboxError::Released);
        }
        let dest = self.resolve(dest_path);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SandboxError::OpError(e.to_string()))?;
        }
        tokio::fs::write(&dest, bytes)
            .await
            .map_err(|e| SandboxError::OpError(e.to_string()))
    }

    async fn download(&self, src_path: &str) -> Result<Vec<u8>, SandboxError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SandboxError::Released);
        }
        let src = self.resolve(src_path);
        tokio::fs::read(&src)
            .await
            .map_err(|e| SandboxError::OpError(e.to_string()))
    }

    async fn disable_internet(&self) -> Result<(), SandboxError> {
        self.internet_disabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}
