//! Task Orchestrator (spec §4.H): drives one (paper, attempt) run
//! through `SETUP → AGENT → REPRODUCE → JUDGE → DONE`, with an
//! `EARLY_EXIT` branch off any phase that yields a zero grade with the
//! failure reason captured rather than propagated. Only `SETUP` and
//! `JUDGE` retry on transient runtime failures (§4.H "Retry policy");
//! `AGENT` and `REPRODUCE` never retry automatically.

mod submission;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use paperbench_blobstore::{BlobStore, BlobStoreError};
use paperbench_judge::{JudgeEngine, JudgeError};
use paperbench_observability::{emit_event, ObservabilityEvent, ProcessKind};
use paperbench_repro::ReproductionRunner;
use paperbench_sandbox::{ReleasableSandbox, SandboxConfig, SandboxRuntime};
use paperbench_snapshot::{AgentProgress, SnapshotCadence, SnapshotLoop};
use paperbench_solver::{AgentSolver, SolverConfig};
use paperbench_types::{
    AgentOutput, JudgeConfig, NetworkMode, PaperBenchResult, ReproductionConfig, RunMetadata, RunRecordPaths, StatusFile,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::Level;

pub use submission::submission_view_from_tar_gz;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("blob store error: {0}")]
    BlobStore(#[from] BlobStoreError),
}

/// What the orchestrator needs to run one (paper, attempt) task. The
/// rubric is passed pre-parsed (§6 wire shape) since the scheduler
/// already owns per-paper rubric loading.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub paper_id: String,
    pub run_id: String,
    pub group_id: String,
    pub rubric: paperbench_types::TaskNodeJson,
    pub instructions: String,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub runs_dir: String,
    pub agent_docker_image: String,
    pub agent_network_mode: NetworkMode,
    pub solver: SolverConfig,
    pub snapshot_cadence: SnapshotCadence,
    pub reproduction: ReproductionConfig,
    pub judge: JudgeConfig,
    /// Resumption is opt-in (§4.H "Resumption... is opt-in via
    /// scheduler flag").
    pub resume: bool,
    /// §4.I: when set, grade the snapshot nearest at-or-before this
    /// many wall-clock hours from agent start, instead of the latest.
    pub target_duration_hr: Option<u32>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            runs_dir: "runs".to_string(),
            agent_docker_image: "pb-env:latest".to_string(),
            agent_network_mode: NetworkMode::Unproxied,
            solver: SolverConfig::default(),
            snapshot_cadence: SnapshotCadence::default(),
            reproduction: ReproductionConfig::default(),
            judge: JudgeConfig::default(),
            resume: false,
            target_duration_hr: None,
        }
    }
}

pub struct TaskOrchestrator<R, Sol> {
    runtime: Arc<R>,
    store: Arc<dyn BlobStore>,
    solver: Arc<Sol>,
    judge: Arc<JudgeEngine>,
    config: OrchestratorConfig,
}

impl<R, Sol> TaskOrchestrator<R, Sol>
where
    R: SandboxRuntime,
    Sol: AgentSolver,
{
    pub fn new(runtime: Arc<R>, store: Arc<dyn BlobStore>, solver: Arc<Sol>, judge: Arc<JudgeEngine>, config: OrchestratorConfig) -> Self {
        Self {
            runtime,
            store,
            solver,
            judge,
            config,
        }
    }

    pub async fn run_task(&self, task: TaskSpec, cancel: CancellationToken) -> PaperBenchResult {
        let paths = RunRecordPaths::new(&self.config.runs_dir, &task.group_id, &task.run_id);

        // SETUP
        let sandbox_config = SandboxConfig {
            docker_image: self.config.agent_docker_image.clone(),
            network_mode: self.config.agent_network_mode,
            ..Default::default()
        };
        let handle = match self.runtime.lease(&sandbox_config).await {
            Ok(handle) => handle,
            Err(err) => return self.early_exit(&task, &paths, "setup", &err.to_string()).await,
        };
        let sandbox = ReleasableSandbox::new(handle);
        let _ = sandbox.exec("mkdir -p submission logs", true).await;
        let _ = sandbox.upload(task.instructions.as_bytes(), "instructions.md").await;
        emit_event(
            Level::INFO,
            ProcessKind::Eval,
            ObservabilityEvent {
                event: "phase_transition",
                component: "orchestrator",
                run_id: Some(&task.run_id),
                paper_id: Some(&task.paper_id),
                group_id: Some(&task.group_id),
                phase: Some("setup"),
                status: Some("ok"),
                detail: None,
            },
        );

        // Resumption check (§4.H "Resumption"): skip AGENT if a
        // status.json and at least one snapshot already exist.
        let already_resumable = self.config.resume && self.is_resumable(&paths).await;

        let agent_output = if already_resumable {
            emit_event(
                Level::INFO,
                ProcessKind::Eval,
                ObservabilityEvent {
                    event: "agent_skipped_on_resume",
                    component: "orchestrator",
                    run_id: Some(&task.run_id),
                    paper_id: Some(&task.paper_id),
                    group_id: Some(&task.group_id),
                    phase: Some("agent"),
                    status: Some("skipped"),
                    detail: None,
                },
            );
            None
        } else {
            Some(self.run_agent(&task, &sandbox, &paths, cancel.clone()).await)
        };

        if let Some(output) = &agent_output {
            let metadata = RunMetadata {
                time_start: output.time_start,
                time_end: Some(output.time_end),
                runtime_in_seconds: Some(output.runtime_in_seconds),
            };
            let bytes = serde_json::to_vec_pretty(&metadata).expect("RunMetadata always serializes");
            let _ = self.store.write(&paths.metadata_json().to_string_lossy(), &bytes).await;
        }

        // Release the agent sandbox before leasing a fresh reproduction
        // sandbox, per §4.A's releasable lease / §4.H's handoff note.
        sandbox.release().await;

        let submission_bytes = self.latest_submission(&paths).await;
        let submission_exists = submission_bytes.is_some();

        if !submission_exists {
            // §8 boundary: timeout/failure with zero snapshots ->
            // submission_exists=false, reproduction skipped, judge
            // short-circuits to zero without ever touching a sandbox.
            let judge_output = self.judge.zero_grade(&task.rubric, &self.config.judge).ok();
            return PaperBenchResult {
                paper_id: task.paper_id,
                run_id: task.run_id,
                submission_exists: false,
                skipped_reproduction: true,
                code_only: self.config.judge.code_only,
                resources_provided: self.config.judge.resources_provided,
                agent_output,
                judge_output,
                reproduction_metadata: None,
                monitor_result: None,
                monitor_ran: false,
            };
        }
        let submission_bytes = submission_bytes.expect("checked above");

        // REPRODUCE
        let (reproduction_metadata, skipped_reproduction) = if self.config.reproduction.skip_reproduction {
            (ReproductionRunner::<R>::skip(), true)
        } else {
            let runner = ReproductionRunner::new(self.runtime.as_ref());
            match runner.run(&submission_bytes, &self.config.reproduction).await {
                Ok(metadata) => (metadata, false),
                Err(err) => {
                    tracing::warn!(run_id = %task.run_id, error = %err, "reproduction failed, grading original submission");
                    (ReproductionRunner::<R>::skip(), false)
                }
            }
        };
        emit_event(
            Level::INFO,
            ProcessKind::Eval,
            ObservabilityEvent {
                event: "phase_transition",
                component: "orchestrator",
                run_id: Some(&task.run_id),
                paper_id: Some(&task.paper_id),
                group_id: Some(&task.group_id),
                phase: Some("reproduce"),
                status: Some(if skipped_reproduction { "skipped" } else { "ran" }),
                detail: None,
            },
        );

        // JUDGE, with retry on transient (blob store) failures only.
        let submission_view = submission_view_from_tar_gz(&submission_bytes).unwrap_or_default();
        let judge_output = self
            .judge_with_retry(&task, &submission_view, cancel.clone())
            .await;

        if let Some(output) = &judge_output {
            let bytes = serde_json::to_vec_pretty(output).expect("JudgeOutput always serializes");
            let _ = self.store.write(&paths.grader_output_json().to_string_lossy(), &bytes).await;
        }

        PaperBenchResult {
            paper_id: task.paper_id,
            run_id: task.run_id,
            submission_exists: true,
            skipped_reproduction,
            code_only: self.config.judge.code_only,
            resources_provided: self.config.judge.resources_provided,
            agent_output,
            judge_output,
            reproduction_metadata: Some(reproduction_metadata),
            monitor_result: None,
            monitor_ran: false,
        }
    }

    async fn run_agent(
        &self,
        task: &TaskSpec,
        sandbox: &ReleasableSandbox,
        paths: &RunRecordPaths,
        cancel: CancellationToken,
    ) -> AgentOutput {
        let progress = AgentProgress::new();
        let snapshot_loop = SnapshotLoop::new(
            sandbox,
            self.store.as_ref(),
            paths.clone(),
            self.config.snapshot_cadence.clone(),
            progress.clone(),
        );
        let snapshot_cancel = CancellationToken::new();

        let budget = self.config.solver.wall_clock_budget;
        let solver = Arc::clone(&self.solver);
        let run_id = task.run_id.clone();
        let instructions = task.instructions.clone();
        let solver_config = self.config.solver.clone();
        let solver_cancel = cancel.clone();

        let (agent_output, _) = tokio::join!(
            async {
                let result = tokio::time::timeout(
                    budget,
                    solver.run(sandbox, &progress, &run_id, &instructions, &solver_config, solver_cancel),
                )
                .await;
                snapshot_cancel.cancel();
                match result {
                    Ok(output) => output,
                    Err(_) => AgentOutput {
                        run_id: run_id.clone(),
                        time_start: Utc::now().timestamp() as f64 - budget.as_secs_f64(),
                        time_end: Utc::now().timestamp() as f64,
                        runtime_in_seconds: budget.as_secs_f64(),
                        error_message: Some("agent wall-clock budget exceeded".to_string()),
                        status_exists: true,
                    },
                }
            },
            snapshot_loop.run(snapshot_cancel.clone()),
        );
        agent_output
    }

    async fn is_resumable(&self, paths: &RunRecordPaths) -> bool {
        let has_status = self.store.exists(&paths.status_json().to_string_lossy()).await;
        let has_snapshot = paperbench_snapshot::snapshot_count(self.store.as_ref(), paths).await > 0;
        has_status && has_snapshot
    }

    /// Selects the snapshot to grade (§4.I): the nearest at-or-before
    /// `target_duration_hr` if configured, otherwise the latest.
    async fn latest_submission(&self, paths: &RunRecordPaths) -> Option<Vec<u8>> {
        let timestamp = match self.config.target_duration_hr {
            Some(hours) => {
                let target_seconds = hours as f64 * 3600.0;
                paperbench_snapshot::select_snapshot_at_or_before(self.store.as_ref(), paths, target_seconds).await?
            }
            None => paperbench_snapshot::latest_snapshot_timestamp(self.store.as_ref(), paths).await?,
        };
        let tar_path = paths.submission_tar_gz(&timestamp).to_string_lossy().into_owned();
        self.store.read(&tar_path).await.ok()
    }

    async fn judge_with_retry(
        &self,
        task: &TaskSpec,
        submission: &paperbench_judge::SubmissionView,
        cancel: CancellationToken,
    ) -> Option<paperbench_types::JudgeOutput> {
        const MAX_ATTEMPTS: u32 = 3;
        let mut attempt = 0;
        let mut backoff = Duration::from_millis(200);
        loop {
            attempt += 1;
            let result = self
                .judge
                .grade(
                    &task.paper_id,
                    &task.rubric,
                    submission,
                    &self.config.judge,
                    serde_json::json!({}),
                    cancel.clone(),
                )
                .await;
            match result {
                Ok(output) => return Some(output),
                Err(JudgeError::BlobStore(err)) if attempt < MAX_ATTEMPTS => {
                    tracing::warn!(run_id = %task.run_id, attempt, error = %err, "judge blob store error, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(err) => {
                    tracing::error!(run_id = %task.run_id, error = %err, "judge failed, no more retries");
                    return self.judge.zero_grade(&task.rubric, &self.config.judge).ok();
                }
            }
        }
    }

    async fn early_exit(&self, task: &TaskSpec, paths: &RunRecordPaths, phase: &str, reason: &str) -> PaperBenchResult {
        emit_event(
            Level::ERROR,
            ProcessKind::Eval,
            ObservabilityEvent {
                event: "early_exit",
                component: "orchestrator",
                run_id: Some(&task.run_id),
                paper_id: Some(&task.paper_id),
                group_id: Some(&task.group_id),
                phase: Some(phase),
                status: Some("failed"),
                detail: Some(reason),
            },
        );
        let now = Utc::now().timestamp();
        let mut status = StatusFile::new_running(now);
        status.mark_error(now);
        if let Ok(bytes) = serde_json::to_vec_pretty(&status) {
            let _ = self.store.write(&paths.status_json().to_string_lossy(), &bytes).await;
        }
        let judge_output = self.judge.zero_grade(&task.rubric, &self.config.judge).ok();
        PaperBenchResult {
            paper_id: task.paper_id.clone(),
            run_id: task.run_id.clone(),
            submission_exists: false,
            skipped_reproduction: true,
            code_only: self.config.judge.code_only,
            resources_provided: self.config.judge.resources_provided,
            agent_output: None,
            judge_output,
            reproduction_metadata: None,
            monitor_result: None,
            monitor_ran: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paperbench_blobstore::LocalBlobStore;
    use paperbench_judge::{DummyScaffold, JudgeEngine};
    use paperbench_sandbox::LocalProcessRuntime;
    use paperbench_solver::DummySolver;
    use paperbench_types::RequirementType;
    use std::sync::Arc;

    fn leaf(id: &str) -> paperbench_types::TaskNodeJson {
        paperbench_types::TaskNodeJson {
            id: id.to_string(),
            requirements: format!("req {id}"),
            weight: 1.0,
            requirement_type: RequirementType::CodeDevelopment,
            sub_nodes: vec![],
        }
    }

    fn rubric() -> paperbench_types::TaskNodeJson {
        paperbench_types::TaskNodeJson {
            id: "root".into(),
            requirements: "root".into(),
            weight: 1.0,
            requirement_type: RequirementType::Other,
            sub_nodes: vec![leaf("a"), leaf("b")],
        }
    }

    #[tokio::test]
    async fn dummy_solver_end_to_end_with_skipped_reproduction() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(dir.path()));
        let runtime = Arc::new(LocalProcessRuntime::new());
        let solver = Arc::new(DummySolver);
        let judge = Arc::new(JudgeEngine::new(Arc::new(DummyScaffold)));

        let mut config = OrchestratorConfig::default();
        config.reproduction.skip_reproduction = true;
        config.solver.step_limit = 1;

        let orchestrator = TaskOrchestrator::new(runtime, store, solver, judge, config);
        let task = TaskSpec {
            paper_id: "paper_a".to_string(),
            run_id: "paper_a_1".to_string(),
            group_id: "group1".to_string(),
            rubric: rubric(),
            instructions: "do the paper".to_string(),
        };

        let result = orchestrator.run_task(task, CancellationToken::new()).await;
        assert!(result.submission_exists);
        assert!(result.skipped_reproduction);
        assert_eq!(result.judge_output.unwrap().score, 0.0);
    }

    /// Solver that panics if ever invoked, for asserting the AGENT
    /// phase was genuinely skipped rather than merely producing a
    /// result that happens to look the same.
    struct PanicsIfCalledSolver;

    #[async_trait::async_trait]
    impl paperbench_solver::AgentSolver for PanicsIfCalledSolver {
        async fn run(
            &self,
            _sandbox: &paperbench_sandbox::ReleasableSandbox,
            _progress: &paperbench_snapshot::AgentProgress,
            _run_id: &str,
            _instructions: &str,
            _config: &paperbench_solver::SolverConfig,
            _cancel: CancellationToken,
        ) -> paperbench_types::AgentOutput {
            panic!("agent phase should have been skipped on resume");
        }
    }

    /// §8 scenario 3: a RunRecord with `status.json` and one snapshot
    /// archive but no `grader_output.json`, re-run with `resume=true`,
    /// must skip the agent phase entirely (never call the solver) and
    /// still produce reproduction + a `grader_output.json` from the
    /// pre-existing snapshot.
    #[tokio::test]
    async fn resume_skips_agent_phase_and_grades_existing_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(dir.path()));
        let runtime = Arc::new(LocalProcessRuntime::new());

        let mut config = OrchestratorConfig::default();
        config.reproduction.skip_reproduction = true;
        config.resume = true;

        let group_id = "group-resume";
        let run_id = "paper_a_resume";
        let paths = paperbench_types::RunRecordPaths::new(&config.runs_dir, group_id, run_id);

        let status = paperbench_types::StatusFile {
            status: "running".to_string(),
            created_at: 0,
            agent_finished_at: None,
            last_updated: 0,
        };
        store
            .write(
                &paths.status_json().to_string_lossy(),
                &serde_json::to_vec(&status).unwrap(),
            )
            .await
            .unwrap();
        store
            .write(
                &paths.submission_tar_gz("2024-01-01T00-00-00Z").to_string_lossy(),
                &preexisting_submission_tar_gz(),
            )
            .await
            .unwrap();

        let solver = Arc::new(PanicsIfCalledSolver);
        let judge = Arc::new(JudgeEngine::new(Arc::new(DummyScaffold)));
        let orchestrator = TaskOrchestrator::new(runtime, Arc::clone(&store), solver, judge, config);
        let task = TaskSpec {
            paper_id: "paper_a".to_string(),
            run_id: run_id.to_string(),
            group_id: group_id.to_string(),
            rubric: rubric(),
            instructions: "do the paper".to_string(),
        };

        let result = orchestrator.run_task(task, CancellationToken::new()).await;

        assert!(result.agent_output.is_none());
        assert!(result.submission_exists);
        assert!(result.skipped_reproduction);
        assert!(result.judge_output.is_some());
        assert!(store.exists(&paths.grader_output_json().to_string_lossy()).await);
        // The pre-existing snapshot must be untouched by resumption.
        assert_eq!(paperbench_snapshot::snapshot_count(store.as_ref(), &paths).await, 1);
    }

    fn preexisting_submission_tar_gz() -> Vec<u8> {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let script = b"#!/bin/bash\necho ok\n";
        let mut header = tar::Header::new_gnu();
        header.set_path("submission/reproduce.sh").unwrap();
        header.set_size(script.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();

        let mut builder = tar::Builder::new(Vec::new());
        builder.append(&header, &script[..]).unwrap();
        let tar_bytes = builder.into_inner().unwrap();

        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&tar_bytes).unwrap();
        gz.finish().unwrap()
    }
}
