use serde::{Deserialize, Serialize};

use crate::rubric::GradedTaskNode;

/// Summary of an agent rollout for a single run (§4.G).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutput {
    pub run_id: String,
    pub time_start: f64,
    pub time_end: f64,
    pub runtime_in_seconds: f64,
    pub error_message: Option<String>,
    pub status_exists: bool,
}

/// A single reproduction attempt, used both for the first run and any
/// salvage retries recorded in `retried_results`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReproScriptRunOutcome {
    pub repro_execution_time: f64,
    pub timedout: bool,
    pub repro_log: String,
}

/// Everything recorded by the Reproduction Runner (§4.F) about one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReproductionMetadata {
    pub is_valid_git_repo: bool,
    pub git_log: String,
    pub repro_script_exists: bool,
    pub files_before_reproduce: String,
    pub files_after_reproduce: String,
    pub timedout: bool,
    pub repro_log: String,
    #[serde(default)]
    pub retried_results: Vec<ReproScriptRunOutcome>,
    pub repro_execution_time: Option<f64>,
    pub git_status_after_reproduce: Option<String>,
    pub executed_submission: Option<String>,
}

/// Token usage accumulated by the judge over all leaf completer calls.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

/// The contents of `grader_output.json` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeOutput {
    pub judge_type: String,
    pub completer_config: serde_json::Value,
    pub score: f64,
    pub num_leaf_nodes: usize,
    pub num_invalid_leaf_nodes: usize,
    pub graded_at: chrono::DateTime<chrono::Utc>,
    pub graded_task_tree: GradedTaskNode,
    pub token_usage: Option<TokenUsage>,
}

impl JudgeOutput {
    pub fn success(&self) -> bool {
        self.num_leaf_nodes == 0 || self.num_invalid_leaf_nodes < self.num_leaf_nodes
    }
}

/// A single finding produced by the Monitor (§4.K).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorFinding {
    pub line_number: usize,
    pub violation: String,
    pub context: String,
    pub context_start: usize,
}

/// Aggregate monitor output for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorResult {
    pub flagged: bool,
    pub findings: Vec<MonitorFinding>,
    pub explanation: String,
}

impl MonitorResult {
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::json!({
            "flagged": self.flagged,
            "findings": self.findings,
            "explanation": self.explanation,
        })
    }
}

/// The grade record for one (paper, attempt) run (§3 Data Model, with
/// the `monitor_result`/`monitor_ran` supplement recovered from the
/// original implementation — see SPEC_FULL.md §3 supplement).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperBenchResult {
    pub paper_id: String,
    pub run_id: String,
    pub submission_exists: bool,
    pub skipped_reproduction: bool,
    pub code_only: bool,
    pub resources_provided: bool,
    pub agent_output: Option<AgentOutput>,
    pub judge_output: Option<JudgeOutput>,
    pub reproduction_metadata: Option<ReproductionMetadata>,
    #[serde(default)]
    pub monitor_result: Option<MonitorResult>,
    #[serde(default)]
    pub monitor_ran: bool,
}

impl PaperBenchResult {
    /// Overall score in [0,1] for this run; 0 when grading never ran.
    pub fn score(&self) -> f64 {
        self.judge_output.as_ref().map(|j| j.score).unwrap_or(0.0)
    }

    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("PaperBenchResult always serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_defaults_to_zero_without_judge_output() {
        let result = PaperBenchResult {
            paper_id: "p".into(),
            run_id: "p_abc".into(),
            submission_exists: false,
            skipped_reproduction: false,
            code_only: false,
            resources_provided: false,
            agent_output: None,
            judge_output: None,
            reproduction_metadata: None,
            monitor_result: None,
            monitor_ran: false,
        };
        assert_eq!(result.score(), 0.0);
    }
}
