//! Snapshot & Upload Loop (spec §4.C): while the agent runs, two
//! background activities mutate the RunRecord — a light status
//! heartbeat every ~5 minutes, and a heavier tar/upload snapshot at a
//! configurable cadence (every N agent steps, every M wall-clock
//! seconds, or both). Snapshot failures are logged and never block
//! agent progress; exactly one final snapshot is taken after the loop
//! is cancelled, and that final upload is shielded from the
//! cancellation that triggered it so the artifact on disk is never
//! partial (spec.md §4.C "Contract", §9 design note).

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use paperbench_blobstore::BlobStore;
use paperbench_sandbox::{ReleasableSandbox, SandboxError};
use paperbench_types::{RunRecordPaths, SnapshotLog, StatusFile};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("sandbox operation failed: {0}")]
    Sandbox(#[from] SandboxError),
    #[error("blob store error: {0}")]
    BlobStore(#[from] paperbench_blobstore::BlobStoreError),
}

/// Cadence configuration for the heavy snapshot (§4.C item 2). A value
/// of `None` in either field disables that trigger; if both are `None`
/// the loop only ever takes the heartbeat and the one final snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotCadence {
    pub every_n_steps: Option<u64>,
    pub every_secs: Option<u64>,
    pub heartbeat_secs: u64,
}

impl Default for SnapshotCadence {
    fn default() -> Self {
        Self {
            every_n_steps: Some(50),
            every_secs: Some(600),
            heartbeat_secs: 300,
        }
    }
}

/// Shared counters the agent solver updates as it runs and the
/// snapshot loop reads to decide when a step-triggered snapshot is due
/// and to compute `productive_runtime_seconds` (the "runtime minus
/// total retry/backoff sleep so far" definition this implementation
/// fixes for the open question in spec.md §9).
#[derive(Debug, Default)]
pub struct AgentProgress {
    step: AtomicU64,
    retry_millis: AtomicU64,
}

impl AgentProgress {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_step(&self) {
        self.step.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_retry_sleep(&self, duration: Duration) {
        self.retry_millis.fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn step_count(&self) -> u64 {
        self.step.load(Ordering::SeqCst)
    }

    fn retry_time(&self) -> Duration {
        Duration::from_millis(self.retry_millis.load(Ordering::SeqCst))
    }
}

/// Drives the two background activities for one run. Constructed once
/// per AGENT phase and consumed by `run`, which does not return until
/// `cancel` fires and the mandatory final snapshot has been written.
pub struct SnapshotLoop<'a> {
    sandbox: &'a ReleasableSandbox,
    store: &'a dyn BlobStore,
    paths: RunRecordPaths,
    cadence: SnapshotCadence,
    progress: Arc<AgentProgress>,
    start: Instant,
}

impl<'a> SnapshotLoop<'a> {
    pub fn new(
        sandbox: &'a ReleasableSandbox,
        store: &'a dyn BlobStore,
        paths: RunRecordPaths,
        cadence: SnapshotCadence,
        progress: Arc<AgentProgress>,
    ) -> Self {
        Self {
            sandbox,
            store,
            paths,
            cadence,
            progress,
            start: Instant::now(),
        }
    }

    /// Runs until `cancel` fires, then performs exactly one more
    /// (shielded) snapshot before returning. Callers drive this as a
    /// background task alongside the agent loop, cancelling it once the
    /// agent has finished (success, timeout, or upstream cancellation).
    pub async fn run(&self, cancel: CancellationToken) {
        let now = Utc::now().timestamp();
        let mut status = StatusFile::new_running(now);
        if let Err(err) = write_status(self.store, &self.paths, &status).await {
            tracing::warn!(error = %err, "initial status.json write failed");
        }

        let heartbeat_task = self.heartbeat_loop(&cancel, &mut status);
        let heavy_task = self.heavy_loop(&cancel);
        tokio::join!(heartbeat_task, heavy_task);

        // Final snapshot: deliberately awaited outside the cancelled
        // select! arms above so it cannot itself be cut short by the
        // same token that just stopped the periodic triggers.
        if let Err(err) = self.take_snapshot().await {
            tracing::warn!(error = %err, "final snapshot failed");
        }
        status.mark_done(Utc::now().timestamp());
        if let Err(err) = write_status(self.store, &self.paths, &status).await {
            tracing::warn!(error = %err, "final status.json write failed");
        }
    }

    async fn heartbeat_loop(&self, cancel: &CancellationToken, status: &mut StatusFile) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(self.cadence.heartbeat_secs)) => {
                    status.heartbeat(Utc::now().timestamp());
                    if let Err(err) = write_status(self.store, &self.paths, status).await {
                        tracing::warn!(error = %err, "status heartbeat write failed");
                    }
                }
                _ = cancel.cancelled() => return,
            }
        }
    }

    async fn heavy_loop(&self, cancel: &CancellationToken) {
        let mut last_snapshot_step = 0u64;
        loop {
            let wait = self.next_wait(last_snapshot_step);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    last_snapshot_step = self.progress.step_count();
                    if let Err(err) = self.take_snapshot().await {
                        tracing::warn!(error = %err, "periodic snapshot failed");
                    }
                }
                _ = cancel.cancelled() => return,
            }
        }
    }

    /// How long to sleep before the next heavy trigger is due. Time-based
    /// triggers align to `floor(now / interval) * interval` (spec.md §9
    /// "drift-avoidance requirement") so snapshot cadence does not slip
    /// later with every upload that itself takes nontrivial time; the
    /// step-based trigger is polled at a short fixed tick since there is
    /// no wall-clock deadline to align it to.
    fn next_wait(&self, last_snapshot_step: u64) -> Duration {
        let mut candidates = Vec::new();
        if let Some(interval) = self.cadence.every_secs {
            if interval > 0 {
                let elapsed = self.start.elapsed().as_secs();
                let next_boundary = (elapsed / interval + 1) * interval;
                candidates.push(Duration::from_secs(next_boundary - elapsed));
            }
        }
        if let Some(every_n) = self.cadence.every_n_steps {
            let steps_since = self.progress.step_count().saturating_sub(last_snapshot_step);
            if steps_since >= every_n {
                candidates.push(Duration::from_millis(0));
            } else {
                candidates.push(Duration::from_secs(1));
            }
        }
        candidates.into_iter().min().unwrap_or(Duration::from_secs(u64::MAX / 2))
    }

    async fn take_snapshot(&self) -> Result<(), SnapshotError> {
        const REMOTE_ARCHIVE_PATH: &str = "/tmp/pb_snapshot.tar.gz";
        let tar_cmd = format!(
            "mkdir -p submission logs && tar --ignore-failed-read -czf {path} submission logs",
            path = REMOTE_ARCHIVE_PATH
        );
        self.sandbox.exec(&tar_cmd, true).await?;
        let archive = self.sandbox.download(REMOTE_ARCHIVE_PATH).await?;

        let timestamp = Utc::now().format("%Y-%m-%dT%H-%M-%S%.6fZ").to_string();
        self.store
            .write(&self.paths.submission_tar_gz(&timestamp).to_string_lossy(), &archive)
            .await?;

        let runtime_seconds = self.start.elapsed().as_secs_f64();
        let retry_time_seconds = self.progress.retry_time().as_secs_f64();
        let log = SnapshotLog {
            agent_step: self.progress.step_count(),
            runtime_seconds,
            productive_runtime_seconds: (runtime_seconds - retry_time_seconds).max(0.0),
            retry_time_seconds,
        };
        let log_bytes = serde_json::to_vec_pretty(&log).expect("SnapshotLog always serializes");
        self.store
            .write(&self.paths.submission_log_json(&timestamp).to_string_lossy(), &log_bytes)
            .await?;

        tracing::info!(timestamp = %timestamp, step = log.agent_step, "snapshot written");
        Ok(())
    }
}

async fn write_status(
    store: &dyn BlobStore,
    paths: &RunRecordPaths,
    status: &StatusFile,
) -> Result<(), paperbench_blobstore::BlobStoreError> {
    let bytes = serde_json::to_vec_pretty(status).expect("StatusFile always serializes");
    store.write(&paths.status_json().to_string_lossy(), &bytes).await
}

/// Count how many `submissions/<ts>/` directories exist for a run.
/// Used by resumption checks (§4.H) and by the monotonic-count
/// invariant in §8.
pub async fn snapshot_count(store: &dyn BlobStore, paths: &RunRecordPaths) -> usize {
    store
        .list(&paths.submissions_dir().to_string_lossy())
        .await
        .map(|entries| entries.len())
        .unwrap_or(0)
}

pub fn run_record_root(paths: &RunRecordPaths) -> &Path {
    paths.root()
}

/// Pick which snapshot timestamp to grade (§4.I `target_duration_hr`):
/// "nearest at-or-before that wall clock point from agent start". Reads
/// every snapshot's `log.json` for its recorded `runtime_seconds` and
/// returns the timestamp with the largest `runtime_seconds` that does
/// not exceed `target_seconds`. Returns `None` if the directory is
/// empty or every snapshot was taken after the target point (there was
/// nothing to grade yet at that point in the run).
pub async fn select_snapshot_at_or_before(
    store: &dyn BlobStore,
    paths: &RunRecordPaths,
    target_seconds: f64,
) -> Option<String> {
    let entries = store.list(&paths.submissions_dir().to_string_lossy()).await.ok()?;
    let mut best: Option<(f64, String)> = None;
    for entry in entries {
        if entry.ends_with(".tmp") {
            continue;
        }
        let timestamp = entry.trim_end_matches('/').rsplit('/').next().unwrap_or(&entry).to_string();
        let log_path = paths.submission_log_json(&timestamp).to_string_lossy().into_owned();
        let Ok(bytes) = store.read(&log_path).await else { continue };
        let Ok(log): Result<SnapshotLog, _> = serde_json::from_slice(&bytes) else { continue };
        if log.runtime_seconds > target_seconds {
            continue;
        }
        match &best {
            Some((best_runtime, _)) if *best_runtime >= log.runtime_seconds => {}
            _ => best = Some((log.runtime_seconds, timestamp)),
        }
    }
    best.map(|(_, timestamp)| timestamp)
}

/// The latest snapshot timestamp, i.e. the default selection when no
/// `target_duration_hr` is configured.
pub async fn latest_snapshot_timestamp(store: &dyn BlobStore, paths: &RunRecordPaths) -> Option<String> {
    let entries = store.list(&paths.submissions_dir().to_string_lossy()).await.ok()?;
    entries
        .iter()
        .filter(|e| !e.ends_with(".tmp"))
        .max()
        .map(|entry| entry.trim_end_matches('/').rsplit('/').next().unwrap_or(entry).to_string())
}
