use tokio::sync::Mutex;

use crate::{ExecOutput, SandboxError, SandboxHandle};

/// Two-phase sandbox handle (spec §9 design note): `Active` until
/// `release()` is called, then `Released` forever after. Every
/// operation checks the state before touching the inner handle, so a
/// release that races with an in-flight `exec` still fails that `exec`
/// with `SandboxError::Released` rather than corrupting shared state.
///
/// This is the *only* mutator of a sandbox's lease lifecycle (§4.A);
/// callers that want to hand a sandbox back early (so a later stage can
/// lease a fresh one without holding two at once — the Orchestrator
/// does this between AGENT and REPRODUCE, §4.H) call `release()` before
/// the wrapper itself is dropped.
pub struct ReleasableSandbox {
    inner: Mutex<SandboxState>,
}

pub enum SandboxState {
    Active(Box<dyn SandboxHandle>),
    Released,
}

impl ReleasableSandbox {
    pub fn new(handle: Box<dyn SandboxHandle>) -> Self {
        Self {
            inner: Mutex::new(SandboxState::Active(handle)),
        }
    }

    pub async fn exec(&self, cmd: &str, idempotent: bool) -> Result<ExecOutput, SandboxError> {
        let guard = self.inner.lock().await;
        match &*guard {
            SandboxState::Active(handle) => handle.exec(cmd, idempotent).await,
            SandboxState::Released => Err(SandboxError::Released),
        }
    }

    pub async fn upload(&self, bytes: &[u8], dest_path: &str) -> Result<(), SandboxError> {
        let guard = self.inner.lock().await;
        match &*guard {
            SandboxState::Active(handle) => handle.upload(bytes, dest_path).await,
            SandboxState::Released => Err(SandboxError::Released),
        }
    }

    pub async fn download(&self, src_path: &str) -> Result<Vec<u8>, SandboxError> {
        let guard = self.inner.lock().await;
        match &*guard {
            SandboxState::Active(handle) => handle.download(src_path).await,
            SandboxState::Released => Err(SandboxError::Released),
        }
    }

    pub async fn disable_internet(&self) -> Result<(), SandboxError> {
        let guard = self.inner.lock().await;
        match &*guard {
            SandboxState::Active(handle) => handle.disable_internet().await,
            SandboxState::Released => Err(SandboxError::Released),
        }
    }

    /// Best-effort stop and invalidate. Idempotent: releasing an
    /// already-released sandbox succeeds silently (§4.A, §8 "double
    /// release is a no-op").
    pub async fn release(&self) {
        let mut guard = self.inner.lock().await;
        if let SandboxState::Active(handle) = &*guard {
            handle.stop().await;
        }
        *guard = SandboxState::Released;
    }

    pub async fn is_released(&self) -> bool {
        matches!(&*self.inner.lock().await, SandboxState::Released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LocalProcessRuntime;
    use crate::SandboxConfig;
    use crate::SandboxRuntime;

    #[tokio::test]
    async fn operations_fail_after_release() {
        let runtime = LocalProcessRuntime::new();
        let handle = runtime.lease(&SandboxConfig::default()).await.unwrap();
        let releasable = ReleasableSandbox::new(handle);

        assert!(releasable.exec("echo hi", true).await.is_ok());
        releasable.release().await;
        let err = releasable.exec("echo hi", true).await.unwrap_err();
        assert!(matches!(err, SandboxError::Released));
    }

    #[tokio::test]
    async fn double_release_is_a_no_op() {
        let runtime = LocalProcessRuntime::new();
        let handle = runtime.lease(&SandboxConfig::default()).await.unwrap();
        let releasable = ReleasableSandbox::new(handle);
        releasable.release().await;
        releasable.release().await;
        assert!(releasable.is_released().await);
    }
}
