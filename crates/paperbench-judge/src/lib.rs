//! Judge Engine (spec §4.E): grades a submission against a rubric tree
//! using a bounded pool of concurrent leaf completer calls, then
//! aggregates bottom-up and writes `grader_output.json`.

pub mod scaffold;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use paperbench_blobstore::{BlobStore, BlobStoreError};
use paperbench_rubric::{FilterPolicy, RubricError, RubricTree};
use paperbench_types::{GradedTaskNode, JudgeConfig, JudgeOutput, TaskNodeJson, TokenUsage};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

pub use scaffold::{DummyScaffold, JudgeScaffold, LeafContext, LeafGrade, RandomScaffold, SimpleScaffold};

#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("submission does not exist for run")]
    SubmissionMissing,
    #[error("malformed rubric: {0}")]
    Rubric(#[from] RubricError),
    #[error("blob store error: {0}")]
    BlobStore(#[from] BlobStoreError),
    #[error("judge run cancelled")]
    Cancelled,
}

/// A read-only view over submission files available to the scaffold
/// when building leaf prompts. Kept deliberately simple: the engine
/// does not implement file-relevance search itself, it hands every
/// leaf the same bounded excerpt of the submission tree.
#[derive(Debug, Clone, Default)]
pub struct SubmissionView {
    files: HashMap<String, String>,
}

impl SubmissionView {
    pub fn new(files: HashMap<String, String>) -> Self {
        Self { files }
    }

    pub fn excerpt(&self, max_chars: usize) -> String {
        let mut out = String::new();
        let mut paths: Vec<&String> = self.files.keys().collect();
        paths.sort();
        for path in paths {
            if out.len() >= max_chars {
                break;
            }
            out.push_str("=== ");
            out.push_str(path);
            out.push_str(" ===\n");
            out.push_str(&self.files[path]);
            out.push('\n');
        }
        out.truncate(max_chars.min(out.len()));
        out
    }
}

pub struct JudgeEngine {
    scaffold: Arc<dyn JudgeScaffold>,
}

impl JudgeEngine {
    pub fn new(scaffold: Arc<dyn JudgeScaffold>) -> Self {
        Self { scaffold }
    }

    /// Operation 1's negative branch (§4.E): the submission never
    /// existed, so every leaf is marked invalid without dispatching a
    /// single completer call, and the tree aggregates to zero exactly as
    /// it would if every leaf grade had failed.
    pub fn zero_grade(&self, rubric_root: &TaskNodeJson, config: &JudgeConfig) -> Result<JudgeOutput, JudgeError> {
        let mut tree = RubricTree::from_json(rubric_root)?;
        for idx in tree.grading_targets(config.max_depth) {
            tree.set_leaf_invalid(idx, "submission does not exist".to_string());
        }
        let policy = FilterPolicy {
            code_only: config.code_only,
            resources_provided: config.resources_provided,
            resource_node_ids: config.resource_node_ids.iter().cloned().collect(),
        };
        tree.aggregate(config.max_depth, &policy);
        Ok(JudgeOutput {
            judge_type: self.scaffold.judge_type().to_string(),
            completer_config: serde_json::json!({}),
            score: tree.overall_score(),
            num_leaf_nodes: tree.num_leaf_nodes(config.max_depth),
            num_invalid_leaf_nodes: tree.num_invalid_leaf_nodes(config.max_depth),
            graded_at: Utc::now(),
            graded_task_tree: tree.to_graded_tree(config.max_depth),
            token_usage: None,
        })
    }

    /// Run the full grading protocol (§4.E operations 2-5; operation 1,
    /// the submission-existence check, is the caller's responsibility —
    /// the orchestrator knows the RunRecord layout, this engine does
    /// not).
    pub async fn grade(
        &self,
        paper_id: &str,
        rubric_root: &TaskNodeJson,
        submission: &SubmissionView,
        config: &JudgeConfig,
        completer_config: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<JudgeOutput, JudgeError> {
        let mut tree = RubricTree::from_json(rubric_root)?;
        let targets = tree.grading_targets(config.max_depth);
        let excerpt = submission.excerpt(8_000);

        let semaphore = Arc::new(Semaphore::new(config.leaf_pool_size.max(1)));
        let mut join_set = tokio::task::JoinSet::new();

        for idx in &targets {
            let idx = *idx;
            let node_id = tree.id(idx).to_string();
            let requirements = tree.requirements(idx).to_string();
            let paper_id = paper_id.to_string();
            let excerpt = excerpt.clone();
            let scaffold = Arc::clone(&self.scaffold);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();

            join_set.spawn(async move {
                let acquired = tokio::select! {
                    permit = semaphore.acquire_owned() => permit.ok(),
                    _ = cancel.cancelled() => None,
                };
                let Some(_permit) = acquired else {
                    return (idx, None);
                };
                let context = LeafContext {
                    paper_id: &paper_id,
                    node_id: &node_id,
                    requirements: &requirements,
                    submission_excerpt: &excerpt,
                };
                let grade = tokio::select! {
                    grade = scaffold.grade_leaf(&context) => Some(grade),
                    _ = cancel.cancelled() => None,
                };
                (idx, grade)
            });
        }

        let mut total_usage = TokenUsage::default();
        let mut any_cancelled = false;
        while let Some(joined) = join_set.join_next().await {
            let (idx, grade) = joined.map_err(|_| JudgeError::Cancelled)?;
            match grade {
                Some(grade) => {
                    if let Some(usage) = grade.usage {
                        total_usage.prompt += usage.prompt_tokens;
                        total_usage.completion += usage.completion_tokens;
                        total_usage.total += usage.total_tokens;
                    }
                    if grade.valid_score {
                        tree.set_leaf_grade(idx, grade.score, grade.explanation);
                    } else {
                        tree.set_leaf_invalid(idx, grade.explanation);
                    }
                }
                None => {
                    any_cancelled = true;
                    tree.set_leaf_invalid(idx, "cancelled before grading completed".to_string());
                }
            }
        }

        if any_cancelled && cancel.is_cancelled() {
            return Err(JudgeError::Cancelled);
        }

        let policy = FilterPolicy {
            code_only: config.code_only,
            resources_provided: config.resources_provided,
            resource_node_ids: config.resource_node_ids.iter().cloned().collect(),
        };
        tree.aggregate(config.max_depth, &policy);

        let graded_task_tree: GradedTaskNode = tree.to_graded_tree(config.max_depth);
        Ok(JudgeOutput {
            judge_type: self.scaffold.judge_type().to_string(),
            completer_config,
            score: tree.overall_score(),
            num_leaf_nodes: tree.num_leaf_nodes(config.max_depth),
            num_invalid_leaf_nodes: tree.num_invalid_leaf_nodes(config.max_depth),
            graded_at: Utc::now(),
            graded_task_tree,
            token_usage: if total_usage.total > 0 { Some(total_usage) } else { None },
        })
    }
}

/// Writes `grader_output.json` at `path` through the blob store, using
/// the same atomic write every on-disk artifact in this workspace goes
/// through.
pub async fn write_grader_output(
    store: &dyn BlobStore,
    path: &str,
    output: &JudgeOutput,
) -> Result<(), JudgeError> {
    let bytes = serde_json::to_vec_pretty(output).expect("JudgeOutput always serializes");
    store.write(path, &bytes).await?;
    Ok(())
}
