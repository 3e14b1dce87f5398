use serde::{Deserialize, Serialize};

/// The category a rubric requirement falls into. Drives the judge's
/// filter policies (`code_only`, `resources_provided`) in `paperbench-rubric`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequirementType {
    CodeDevelopment,
    CodeExecution,
    ResultMatch,
    Other,
}

/// Wire shape of a rubric JSON file, before it is loaded into the
/// arena-backed tree that `paperbench-rubric` operates on. Mirrors the
/// recursive shape in §6 of the specification verbatim so that rubric
/// fixtures can be deserialized with plain `serde_json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskNodeJson {
    pub id: String,
    pub requirements: String,
    pub weight: f64,
    pub requirement_type: RequirementType,
    #[serde(default)]
    pub sub_nodes: Vec<TaskNodeJson>,
}

/// The judge-populated fields attached to a node once grading has run.
/// Kept as a standalone struct (rather than flattening into the graded
/// tree) so a pre-grading `TaskNodeJson` and a post-grading node share
/// the same required fields and only differ by this optional overlay.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JudgeFields {
    pub score: Option<f64>,
    pub valid_score: bool,
    pub explanation: Option<String>,
    #[serde(default)]
    pub judge_metadata: serde_json::Map<String, serde_json::Value>,
}

/// A fully graded rubric node, as written into `grader_output.json`.
/// Produced by `paperbench-rubric`'s aggregation pass; defined here so
/// that both the rubric crate and the judge/orchestrator crates can
/// share one on-disk shape without a dependency cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradedTaskNode {
    pub id: String,
    pub requirements: String,
    pub weight: f64,
    pub requirement_type: RequirementType,
    #[serde(flatten)]
    pub judge: JudgeFields,
    #[serde(default)]
    pub sub_nodes: Vec<GradedTaskNode>,
}

impl GradedTaskNode {
    /// In-order DFS over leaf nodes (nodes with no sub_nodes), matching
    /// §4.D's `leaf_nodes()` traversal operation.
    pub fn leaf_nodes(&self) -> Vec<&GradedTaskNode> {
        if self.sub_nodes.is_empty() {
            vec![self]
        } else {
            self.sub_nodes.iter().flat_map(|n| n.leaf_nodes()).collect()
        }
    }

    /// Depth of this node, root = 0.
    pub fn depth(&self) -> usize {
        if self.sub_nodes.is_empty() {
            0
        } else {
            1 + self.sub_nodes.iter().map(|n| n.depth()).max().unwrap_or(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rubric_json_round_trips() {
        let node = TaskNodeJson {
            id: "root".into(),
            requirements: "do the thing".into(),
            weight: 1.0,
            requirement_type: RequirementType::CodeDevelopment,
            sub_nodes: vec![TaskNodeJson {
                id: "child".into(),
                requirements: "a subtask".into(),
                weight: 0.5,
                requirement_type: RequirementType::ResultMatch,
                sub_nodes: vec![],
            }],
        };
        let json = serde_json::to_string(&node).unwrap();
        let back: TaskNodeJson = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, node.id);
        assert_eq!(back.sub_nodes.len(), 1);
        assert_eq!(back.sub_nodes[0].id, "child");
    }

    #[test]
    fn leaf_nodes_and_depth() {
        let tree = GradedTaskNode {
            id: "root".into(),
            requirements: String::new(),
            weight: 1.0,
            requirement_type: RequirementType::Other,
            judge: JudgeFields::default(),
            sub_nodes: vec![
                GradedTaskNode {
                    id: "a".into(),
                    requirements: String::new(),
                    weight: 1.0,
                    requirement_type: RequirementType::Other,
                    judge: JudgeFields::default(),
                    sub_nodes: vec![],
                },
                GradedTaskNode {
                    id: "b".into(),
                    requirements: String::new(),
                    weight: 1.0,
                    requirement_type: RequirementType::Other,
                    judge: JudgeFields::default(),
                    sub_nodes: vec![GradedTaskNode {
                        id: "b1".into(),
                        requirements: String::new(),
                        weight: 1.0,
                        requirement_type: RequirementType::Other,
                        judge: JudgeFields::default(),
                        sub_nodes: vec![],
                    }],
                },
            ],
        };
        assert_eq!(tree.leaf_nodes().len(), 2);
        assert_eq!(tree.depth(), 2);
    }
}
