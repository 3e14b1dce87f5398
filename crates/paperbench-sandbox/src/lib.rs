//! Sandbox Gateway (spec §4.A): a uniform façade over whatever runs a
//! task's container — lease, exec, file transfer, release. The
//! container runtime itself (Docker, a remote cluster) is an external
//! collaborator; this crate fixes the trait boundary the rest of the
//! workspace programs against and ships one concrete implementation,
//! `LocalProcessRuntime`, that runs commands as host subprocesses under
//! a per-lease temp directory — sufficient for local development and
//! the test suite, not a production container driver.

mod local;
mod releasable;

use std::collections::HashMap;

use async_trait::async_trait;
use paperbench_types::NetworkMode;
use thiserror::Error;

pub use local::LocalProcessRuntime;
pub use releasable::{ReleasableSandbox, SandboxState};

/// Parameters for leasing a sandbox (§4.A `lease(config)`).
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub docker_image: String,
    pub network_mode: NetworkMode,
    pub environment: HashMap<String, String>,
    /// Exception-kind names the runtime's retry policy should retry on.
    /// An empty set means "retry any transient start failure" — the
    /// default chosen here matches the original implementation's
    /// `AlcatrazPBRuntimeConfig`, which retries on its single concrete
    /// exception type rather than every error.
    pub retryable_exception_kinds: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            docker_image: "pb-env:latest".to_string(),
            network_mode: NetworkMode::Unproxied,
            environment: HashMap::new(),
            retryable_exception_kinds: vec!["transient".to_string()],
        }
    }
}

/// Result of a single-shot `exec` (§4.A). The sandbox preserves no
/// shell state between execs, so `combined_output` interleaves stdout
/// and stderr exactly as a single invocation produced them.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub combined_output: Vec<u8>,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn output_text(&self) -> String {
        String::from_utf8_lossy(&self.combined_output).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox start failed after {attempts} attempts: {reason}")]
    StartFailure { attempts: u32, reason: String },
    #[error("sandbox operation failed: {0}")]
    OpError(String),
    #[error("operation attempted on a released sandbox")]
    Released,
}

/// A single `lease_once` failure, carrying the exception-kind name
/// `SandboxConfig::retryable_exception_kinds` is checked against (§4.A:
/// "Retry is only attempted for exception kinds declared by the runtime
/// configuration").
#[derive(Debug, Clone)]
pub struct LeaseFailure {
    pub kind: String,
    pub message: String,
}

impl std::fmt::Display for LeaseFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

/// A single live sandbox. Implementations are not required to be
/// `Clone`; callers interact with a handle exclusively through a
/// `ReleasableSandbox` wrapper (see `releasable`), which is the only
/// mutator of lease lifecycle per §4.A's exclusivity invariant.
#[async_trait]
pub trait SandboxHandle: Send + Sync {
    /// Execute a single shell command inside the sandbox. `idempotent`
    /// is a hint implementations may use to decide whether a transient
    /// failure is safe to retry internally; this crate's gateway layer
    /// does not retry `exec` itself (only `lease` retries, per §4.A).
    async fn exec(&self, cmd: &str, idempotent: bool) -> Result<ExecOutput, SandboxError>;

    async fn upload(&self, bytes: &[u8], dest_path: &str) -> Result<(), SandboxError>;

    async fn download(&self, src_path: &str) -> Result<Vec<u8>, SandboxError>;

    /// Post-creation firewall tightening; idempotent.
    async fn disable_internet(&self) -> Result<(), SandboxError>;

    /// Best-effort stop. Safe to call more than once.
    async fn stop(&self);
}

/// A runtime capable of leasing sandboxes, with the bounded retry
/// policy §4.A fixes: default 3 attempts with exponential backoff,
/// retried only for exception kinds the caller's `SandboxConfig`
/// declares retryable.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    async fn lease_once(&self, config: &SandboxConfig) -> Result<Box<dyn SandboxHandle>, LeaseFailure>;

    async fn lease(&self, config: &SandboxConfig) -> Result<Box<dyn SandboxHandle>, SandboxError> {
        const MAX_ATTEMPTS: u32 = 3;
        let mut attempt = 0;
        let mut backoff = std::time::Duration::from_millis(200);
        loop {
            attempt += 1;
            match self.lease_once(config).await {
                Ok(handle) => return Ok(handle),
                Err(failure) => {
                    let retryable = config.retryable_exception_kinds.is_empty()
                        || config.retryable_exception_kinds.iter().any(|k| k == &failure.kind);
                    if !retryable {
                        tracing::warn!(attempt, kind = %failure.kind, reason = %failure.message, "sandbox lease failed with a non-retryable exception kind");
                        return Err(SandboxError::StartFailure { attempts: attempt, reason: failure.message });
                    }
                    if attempt >= MAX_ATTEMPTS {
                        tracing::warn!(attempt, reason = %failure.message, "sandbox lease exhausted retries");
                        return Err(SandboxError::StartFailure { attempts: attempt, reason: failure.message });
                    }
                    tracing::warn!(attempt, reason = %failure.message, "sandbox lease failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }
}
