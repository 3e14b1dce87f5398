//! Evaluation Scheduler (§4.I): enumerates the `{(paper, attempt)}`
//! task set for a split, mints or reuses run ids, fans tasks out over
//! the orchestrator with bounded concurrency, and keeps running every
//! task through to a `PaperBenchResult` even when individual tasks
//! fail. Metrics & Reporting (§4.J) lives in the same crate: the
//! summary it produces is the scheduler's one externally visible
//! output besides the RunRecords themselves.

use std::collections::BTreeMap;
use std::sync::Arc;

use paperbench_blobstore::{BlobStore, BlobStoreError};
use paperbench_observability::{emit_event, ObservabilityEvent, ProcessKind};
use paperbench_orchestrator::{TaskOrchestrator, TaskSpec};
use paperbench_sandbox::SandboxRuntime;
use paperbench_solver::AgentSolver;
use paperbench_types::{EvalRun, PaperBenchResult, SchedulerConfig, TaskNodeJson};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::Level;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("config error: {0}")]
    Config(#[from] paperbench_types::ConfigError),
    #[error("blob store error: {0}")]
    BlobStore(#[from] BlobStoreError),
}

/// The named set of papers a split covers. The scheduler itself does
/// not know how splits map to paper ids on disk; that lookup is the
/// CLI's job (it owns the paper registry format).
#[derive(Debug, Clone)]
pub struct PaperSplit {
    pub name: String,
    pub paper_ids: Vec<String>,
}

/// Supplies the per-paper rubric and agent instructions the
/// orchestrator needs to build a `TaskSpec`. Kept as a trait so this
/// crate never has to know the on-disk paper repository layout.
///
/// Both methods are fallible: a missing paper or a rubric file that
/// fails to parse is a `ConfigError` (§7 "bad split, missing paper,
/// malformed rubric | Fail fast before scheduling"), not a condition
/// this crate papers over with a placeholder rubric.
pub trait PaperProvider: Send + Sync {
    fn rubric(&self, paper_id: &str) -> Result<TaskNodeJson, paperbench_types::ConfigError>;
    fn instructions(&self, paper_id: &str) -> Result<String, paperbench_types::ConfigError>;
}

/// A single `(paper, attempt)` slot with its resolved run id.
#[derive(Debug, Clone)]
pub struct EvalTask {
    pub paper_id: String,
    pub attempt: usize,
    pub run_id: String,
}

/// Maps `"<paper_id>#<attempt>"` to a previously minted run id so a
/// resumed evaluation reuses the same RunRecord directory instead of
/// starting a disjoint one. Persisted once per group at
/// `<runs_dir>/<group_id>/task_manifest.json`; this file has no
/// counterpart in the original implementation (run ids there are
/// re-derived from directory listings), but the scheduler here only
/// has a content-addressed blob store to work with, so a small
/// manifest is the cheapest grounding for stable resumption (recorded
/// as an Open Question decision in DESIGN.md).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TaskManifest {
    run_ids: BTreeMap<String, String>,
}

impl TaskManifest {
    fn manifest_path(runs_dir: &str, group_id: &str) -> String {
        format!("{}/{}/task_manifest.json", runs_dir.trim_end_matches('/'), group_id)
    }

    async fn load(store: &dyn BlobStore, runs_dir: &str, group_id: &str) -> Self {
        let path = Self::manifest_path(runs_dir, group_id);
        match store.read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    async fn save(&self, store: &dyn BlobStore, runs_dir: &str, group_id: &str) -> Result<(), BlobStoreError> {
        let path = Self::manifest_path(runs_dir, group_id);
        let bytes = serde_json::to_vec_pretty(self).expect("TaskManifest always serializes");
        store.write(&path, &bytes).await
    }
}

/// Per-run aggregate statistics (§4.J), summarized across a full split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalSummary {
    pub group_id: String,
    pub n_papers: usize,
    pub n_tasks_dispatched: usize,
    pub n_tasks_completed: usize,
    pub n_system_errors: usize,
    pub per_paper_mean: BTreeMap<String, f64>,
    pub overall_mean: f64,
    pub standard_error: Option<f64>,
    pub n_rollouts_failed: usize,
    pub n_reproductions_failed: usize,
    pub n_gradings_failed: usize,
    pub mean_reproduction_time_secs: Option<f64>,
    pub n_valid_git_repo: usize,
    pub n_nontrivial_git_log: usize,
    pub n_repro_script_present: usize,
}

pub struct EvaluationScheduler<R, Sol> {
    orchestrator: Arc<TaskOrchestrator<R, Sol>>,
    store: Arc<dyn BlobStore>,
    config: SchedulerConfig,
}

impl<R, Sol> EvaluationScheduler<R, Sol>
where
    R: SandboxRuntime,
    Sol: AgentSolver,
{
    pub fn new(orchestrator: Arc<TaskOrchestrator<R, Sol>>, store: Arc<dyn BlobStore>, config: SchedulerConfig) -> Self {
        Self { orchestrator, store, config }
    }

    /// Enumerate the task set for `split`, resolving each task's run id
    /// against the resume manifest when `resume_run_group_id` is set.
    async fn enumerate_tasks(&self, split: &PaperSplit, group_id: &str) -> Vec<EvalTask> {
        let extend = !self.config.resume_no_extend;
        let mut manifest = if self.config.resume_run_group_id.is_some() {
            TaskManifest::load(self.store.as_ref(), &self.config.runs_dir, group_id).await
        } else {
            TaskManifest::default()
        };

        let mut tasks = Vec::new();
        let mut changed = false;
        for paper_id in &split.paper_ids {
            for attempt in 0..self.config.n_tries {
                let key = format!("{paper_id}#{attempt}");
                let run_id = match manifest.run_ids.get(&key) {
                    Some(existing) => existing.clone(),
                    None => {
                        let minted = format!("{paper_id}_{}", uuid::Uuid::new_v4());
                        if extend {
                            manifest.run_ids.insert(key, minted.clone());
                            changed = true;
                        }
                        minted
                    }
                };
                tasks.push(EvalTask { paper_id: paper_id.clone(), attempt, run_id });
            }
        }

        if changed {
            let _ = manifest.save(self.store.as_ref(), &self.config.runs_dir, group_id).await;
        }
        tasks
    }

    /// Run every task in `split` with bounded concurrency, collect
    /// every `PaperBenchResult` that completes, and return the
    /// aggregate summary. A task whose future panics (a
    /// `RolloutSystemError`, §4.I) is logged and excluded from the
    /// per-paper means rather than aborting the split.
    pub async fn run_split(
        &self,
        split: &PaperSplit,
        group_id: &str,
        provider: &(impl PaperProvider + ?Sized),
        cancel: CancellationToken,
    ) -> Result<(EvalSummary, Vec<PaperBenchResult>), SchedulerError> {
        self.config.validate()?;

        // Fail fast before scheduling (§7 `ConfigError`): resolve every
        // paper's rubric and instructions up front, before any task is
        // dispatched, so a missing paper or malformed rubric aborts the
        // whole split rather than surfacing per-task partway through a
        // run that's already underway.
        let mut per_paper: BTreeMap<String, (TaskNodeJson, String)> = BTreeMap::new();
        for paper_id in &split.paper_ids {
            if per_paper.contains_key(paper_id) {
                continue;
            }
            let rubric = provider.rubric(paper_id)?;
            let instructions = provider.instructions(paper_id)?;
            per_paper.insert(paper_id.clone(), (rubric, instructions));
        }

        let tasks = self.enumerate_tasks(split, group_id).await;
        let n_dispatched = tasks.len();

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut join_set = tokio::task::JoinSet::new();

        for task in tasks {
            let orchestrator = Arc::clone(&self.orchestrator);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let (rubric, instructions) = per_paper
                .get(&task.paper_id)
                .cloned()
                .expect("every split paper_id was resolved above");
            let group_id = group_id.to_string();

            join_set.spawn(async move {
                let permit = semaphore.acquire_owned().await;
                let Ok(_permit) = permit else {
                    return None;
                };
                let spec = TaskSpec {
                    paper_id: task.paper_id.clone(),
                    run_id: task.run_id.clone(),
                    group_id,
                    rubric,
                    instructions,
                };
                Some(orchestrator.run_task(spec, cancel).await)
            });
        }

        let mut results = Vec::new();
        let mut n_system_errors = 0usize;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Some(result)) => results.push(result),
                Ok(None) => n_system_errors += 1,
                Err(err) => {
                    n_system_errors += 1;
                    let detail = err.to_string();
                    emit_event(
                        Level::ERROR,
                        ProcessKind::Eval,
                        ObservabilityEvent {
                            event: "rollout_system_error",
                            component: "scheduler",
                            run_id: None,
                            paper_id: None,
                            group_id: Some(group_id),
                            phase: None,
                            status: Some("failed"),
                            detail: Some(&detail),
                        },
                    );
                }
            }
        }

        let summary = self.summarize(split, group_id, n_dispatched, n_system_errors, &results);
        Ok((summary, results))
    }

    fn summarize(
        &self,
        split: &PaperSplit,
        group_id: &str,
        n_dispatched: usize,
        n_system_errors: usize,
        results: &[PaperBenchResult],
    ) -> EvalSummary {
        let mut per_paper: BTreeMap<String, EvalRun> = split
            .paper_ids
            .iter()
            .map(|id| (id.clone(), EvalRun::new(id.clone())))
            .collect();
        for result in results {
            if let Some(run) = per_paper.get_mut(&result.paper_id) {
                run.results.push(result.clone());
            }
        }

        let per_paper_mean: BTreeMap<String, f64> = per_paper.iter().map(|(id, run)| (id.clone(), run.mean_score())).collect();
        let means: Vec<f64> = per_paper_mean.values().copied().collect();
        let overall_mean = if means.is_empty() { 0.0 } else { means.iter().sum::<f64>() / means.len() as f64 };
        let standard_error = sample_standard_error(&means);

        let n_rollouts_failed = results
            .iter()
            .filter(|r| !r.submission_exists || r.agent_output.as_ref().map(|a| a.error_message.is_some()).unwrap_or(true))
            .count();

        let n_reproductions_failed = results
            .iter()
            .filter(|r| !r.skipped_reproduction)
            .filter(|r| match &r.reproduction_metadata {
                Some(meta) => meta.timedout || !meta.repro_script_exists,
                None => false,
            })
            .count();

        let n_gradings_failed = results.iter().filter(|r| r.judge_output.as_ref().map(|j| !j.success()).unwrap_or(false)).count();

        let repro_times: Vec<f64> = results
            .iter()
            .filter_map(|r| r.reproduction_metadata.as_ref())
            .filter_map(|m| m.repro_execution_time)
            .collect();
        let mean_reproduction_time_secs = if repro_times.is_empty() { None } else { Some(repro_times.iter().sum::<f64>() / repro_times.len() as f64) };

        let n_valid_git_repo = results.iter().filter(|r| r.reproduction_metadata.as_ref().map(|m| m.is_valid_git_repo).unwrap_or(false)).count();
        let n_nontrivial_git_log = results.iter().filter(|r| r.reproduction_metadata.as_ref().map(|m| !m.git_log.trim().is_empty()).unwrap_or(false)).count();
        let n_repro_script_present = results.iter().filter(|r| r.reproduction_metadata.as_ref().map(|m| m.repro_script_exists).unwrap_or(false)).count();

        EvalSummary {
            group_id: group_id.to_string(),
            n_papers: split.paper_ids.len(),
            n_tasks_dispatched: n_dispatched,
            n_tasks_completed: results.len(),
            n_system_errors,
            per_paper_mean,
            overall_mean,
            standard_error,
            n_rollouts_failed,
            n_reproductions_failed,
            n_gradings_failed,
            mean_reproduction_time_secs,
            n_valid_git_repo,
            n_nontrivial_git_log,
            n_repro_script_present,
        }
    }

    /// Writes `summary.json` at `<runs_dir>/<group_id>/summary.json`.
    pub async fn write_summary(&self, group_id: &str, summary: &EvalSummary) -> Result<(), SchedulerError> {
        let path = format!("{}/{}/summary.json", self.config.runs_dir.trim_end_matches('/'), group_id);
        let bytes = serde_json::to_vec_pretty(summary).expect("EvalSummary always serializes");
        self.store.write(&path, &bytes).await?;
        Ok(())
    }
}

/// Sample standard error of the mean over `values`: `None` below two
/// samples, where sample variance is undefined.
fn sample_standard_error(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Some((variance / n).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use paperbench_blobstore::LocalBlobStore;
    use paperbench_judge::{DummyScaffold, JudgeEngine};
    use paperbench_orchestrator::OrchestratorConfig;
    use paperbench_sandbox::LocalProcessRuntime;
    use paperbench_solver::DummySolver;
    use paperbench_types::RequirementType;

    struct FixedProvider;

    impl PaperProvider for FixedProvider {
        fn rubric(&self, paper_id: &str) -> Result<TaskNodeJson, paperbench_types::ConfigError> {
            Ok(TaskNodeJson {
                id: format!("{paper_id}-root"),
                requirements: "root".to_string(),
                weight: 1.0,
                requirement_type: RequirementType::Other,
                sub_nodes: vec![TaskNodeJson {
                    id: format!("{paper_id}-leaf"),
                    requirements: "leaf".to_string(),
                    weight: 1.0,
                    requirement_type: RequirementType::CodeDevelopment,
                    sub_nodes: vec![],
                }],
            })
        }

        fn instructions(&self, paper_id: &str) -> Result<String, paperbench_types::ConfigError> {
            Ok(format!("reproduce {paper_id}"))
        }
    }

    fn scheduler(dir: &std::path::Path) -> EvaluationScheduler<LocalProcessRuntime, DummySolver> {
        let store: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(dir));
        let runtime = Arc::new(LocalProcessRuntime::new());
        let solver = Arc::new(DummySolver);
        let judge = Arc::new(JudgeEngine::new(Arc::new(DummyScaffold)));
        let mut orch_config = OrchestratorConfig::default();
        orch_config.reproduction.skip_reproduction = true;
        orch_config.solver.step_limit = 1;
        let orchestrator = Arc::new(TaskOrchestrator::new(runtime, Arc::clone(&store), solver, judge, orch_config));

        let config = SchedulerConfig {
            n_tries: 2,
            concurrency: 2,
            ..Default::default()
        };
        EvaluationScheduler::new(orchestrator, store, config)
    }

    #[tokio::test]
    async fn run_split_produces_one_result_per_task_and_writes_summary() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(dir.path());
        let split = PaperSplit { name: "debug".to_string(), paper_ids: vec!["paper_a".to_string(), "paper_b".to_string()] };

        let (summary, results) = sched.run_split(&split, "group1", &FixedProvider, CancellationToken::new()).await.unwrap();
        assert_eq!(results.len(), 4);
        assert_eq!(summary.n_papers, 2);
        assert_eq!(summary.per_paper_mean.len(), 2);
        assert_eq!(summary.n_system_errors, 0);

        sched.write_summary("group1", &summary).await.unwrap();
        let store = LocalBlobStore::new(dir.path());
        assert!(store.exists("runs/group1/summary.json").await);
    }

    #[tokio::test]
    async fn enumerate_tasks_reuses_manifest_run_ids_on_resume() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(dir.path());
        let split = PaperSplit { name: "debug".to_string(), paper_ids: vec!["paper_a".to_string()] };

        let first = sched.enumerate_tasks(&split, "group1").await;

        let mut resumed_config = sched.config.clone();
        resumed_config.resume_run_group_id = Some("group1".to_string());
        let resumed = EvaluationScheduler::new(Arc::clone(&sched.orchestrator), Arc::clone(&sched.store), resumed_config);
        let second = resumed.enumerate_tasks(&split, "group1").await;

        assert_eq!(first[0].run_id, second[0].run_id);
    }

    #[test]
    fn standard_error_is_none_below_two_samples() {
        assert_eq!(sample_standard_error(&[0.5]), None);
        assert!(sample_standard_error(&[0.2, 0.8]).is_some());
    }

    /// §8 scenario 2: two papers, two attempts each. One attempt per
    /// paper raises mid-agent (no submission ever produced); the other
    /// succeeds and is graded at 0.5. Expected: per-paper means
    /// `A=0.25, B=0.25`, overall mean `0.25`, `n_rollouts_failed=2`.
    struct ScriptedSolver {
        should_fail: std::collections::HashSet<String>,
    }

    #[async_trait::async_trait]
    impl AgentSolver for ScriptedSolver {
        async fn run(
            &self,
            sandbox: &paperbench_sandbox::ReleasableSandbox,
            progress: &paperbench_snapshot::AgentProgress,
            run_id: &str,
            _instructions: &str,
            _config: &paperbench_solver::SolverConfig,
            _cancel: CancellationToken,
        ) -> paperbench_types::AgentOutput {
            progress.record_step();
            if self.should_fail.contains(run_id) {
                return paperbench_types::AgentOutput {
                    run_id: run_id.to_string(),
                    time_start: 0.0,
                    time_end: 0.0,
                    runtime_in_seconds: 0.0,
                    error_message: Some("simulated agent failure mid-rollout".to_string()),
                    status_exists: true,
                };
            }
            let _ = sandbox.exec("mkdir -p submission logs", true).await;
            let _ = sandbox
                .upload(b"#!/bin/bash\necho ok\n", "submission/reproduce.sh")
                .await;
            paperbench_types::AgentOutput {
                run_id: run_id.to_string(),
                time_start: 0.0,
                time_end: 0.0,
                runtime_in_seconds: 0.0,
                error_message: None,
                status_exists: true,
            }
        }
    }

    /// Always scores the single leaf at 0.5, so a successful rollout's
    /// root score is deterministic instead of the always-zero
    /// `DummyScaffold`.
    struct HalfScoreScaffold;

    #[async_trait::async_trait]
    impl paperbench_judge::JudgeScaffold for HalfScoreScaffold {
        fn judge_type(&self) -> &'static str {
            "half"
        }

        async fn grade_leaf(&self, _context: &paperbench_judge::LeafContext<'_>) -> paperbench_judge::LeafGrade {
            paperbench_judge::LeafGrade {
                score: 0.5,
                explanation: "fixed half score".to_string(),
                valid_score: true,
                usage: None,
            }
        }
    }

    #[tokio::test]
    async fn run_split_matches_scenario_2_half_failing_counters() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(dir.path()));
        let runtime = Arc::new(LocalProcessRuntime::new());

        // Deterministic run ids, one per (paper, attempt), seeded into
        // the resume manifest so the scripted solver can target exactly
        // which attempts fail without racing the scheduler's own uuid
        // minting.
        let group_id = "group-scenario-2";
        let run_ids = [
            ("paper_a", 0, "run-a0"),
            ("paper_a", 1, "run-a1"),
            ("paper_b", 0, "run-b0"),
            ("paper_b", 1, "run-b1"),
        ];
        let manifest = TaskManifest {
            run_ids: run_ids
                .iter()
                .map(|(paper, attempt, run_id)| (format!("{paper}#{attempt}"), run_id.to_string()))
                .collect(),
        };
        manifest.save(store.as_ref(), "runs", group_id).await.unwrap();

        let should_fail: std::collections::HashSet<String> = ["run-a0", "run-b1"].iter().map(|s| s.to_string()).collect();
        let solver = Arc::new(ScriptedSolver { should_fail });
        let judge = Arc::new(JudgeEngine::new(Arc::new(HalfScoreScaffold)));

        let mut orch_config = OrchestratorConfig::default();
        orch_config.reproduction.skip_reproduction = true;
        orch_config.solver.step_limit = 1;
        let orchestrator = Arc::new(TaskOrchestrator::new(runtime, Arc::clone(&store), solver, judge, orch_config));

        let config = SchedulerConfig {
            n_tries: 2,
            concurrency: 2,
            resume_run_group_id: Some(group_id.to_string()),
            ..Default::default()
        };
        let sched = EvaluationScheduler::new(orchestrator, Arc::clone(&store), config);
        let split = PaperSplit { name: "debug".to_string(), paper_ids: vec!["paper_a".to_string(), "paper_b".to_string()] };

        let (summary, results) = sched.run_split(&split, group_id, &FixedProvider, CancellationToken::new()).await.unwrap();

        assert_eq!(results.len(), 4);
        assert_eq!(summary.n_system_errors, 0);
        assert_eq!(summary.n_rollouts_failed, 2);
        assert!((summary.per_paper_mean["paper_a"] - 0.25).abs() < 1e-9);
        assert!((summary.per_paper_mean["paper_b"] - 0.25).abs() < 1e-9);
        assert!((summary.overall_mean - 0.25).abs() < 1e-9);
    }

    /// A provider whose rubric lookup fails for one paper in the split.
    struct FailingProvider;

    impl PaperProvider for FailingProvider {
        fn rubric(&self, paper_id: &str) -> Result<TaskNodeJson, paperbench_types::ConfigError> {
            if paper_id == "paper_bad" {
                return Err(paperbench_types::ConfigError::MalformedRubric(paper_id.to_string()));
            }
            FixedProvider.rubric(paper_id)
        }

        fn instructions(&self, paper_id: &str) -> Result<String, paperbench_types::ConfigError> {
            FixedProvider.instructions(paper_id)
        }
    }

    /// Solver that panics if ever invoked, used to prove no task was
    /// dispatched before the fail-fast rubric check ran.
    struct PanicsIfCalledSolver;

    #[async_trait::async_trait]
    impl AgentSolver for PanicsIfCalledSolver {
        async fn run(
            &self,
            _sandbox: &paperbench_sandbox::ReleasableSandbox,
            _progress: &paperbench_snapshot::AgentProgress,
            _run_id: &str,
            _instructions: &str,
            _config: &paperbench_solver::SolverConfig,
            _cancel: CancellationToken,
        ) -> paperbench_types::AgentOutput {
            panic!("no task should have been dispatched: rubric resolution must fail fast");
        }
    }

    /// §7: a malformed rubric for any paper in the split is a
    /// `ConfigError` that must abort the whole split before any task
    /// is scheduled, not surface per-task partway through a run.
    #[tokio::test]
    async fn run_split_fails_fast_on_malformed_rubric_before_dispatching_any_task() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(dir.path()));
        let runtime = Arc::new(LocalProcessRuntime::new());
        let solver = Arc::new(PanicsIfCalledSolver);
        let judge = Arc::new(JudgeEngine::new(Arc::new(DummyScaffold)));
        let orchestrator = Arc::new(TaskOrchestrator::new(runtime, Arc::clone(&store), solver, judge, OrchestratorConfig::default()));

        let config = SchedulerConfig { n_tries: 1, concurrency: 2, ..Default::default() };
        let sched = EvaluationScheduler::new(orchestrator, Arc::clone(&store), config);
        let split = PaperSplit { name: "debug".to_string(), paper_ids: vec!["paper_ok".to_string(), "paper_bad".to_string()] };

        let err = sched
            .run_split(&split, "group-fail-fast", &FailingProvider, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Config(paperbench_types::ConfigError::MalformedRubric(_))));
    }
}
