//! Rubric Model (spec §4.D). The source represents a `TaskNode` as an
//! ordinary object graph; per spec.md §9's design note this
//! implementation uses an arena of nodes addressed by integer index
//! with a parent pointer, so serialization is a flat walk and
//! aggregation is a single bottom-up pass over indices rather than a
//! recursive mutation of a cyclic-looking structure.

use std::collections::HashSet;

use paperbench_types::{GradedTaskNode, JudgeFields, RequirementType, TaskNodeJson};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RubricError {
    #[error("duplicate node id in rubric: {0}")]
    DuplicateId(String),
}

#[derive(Debug, Clone)]
struct NodeData {
    id: String,
    requirements: String,
    weight: f64,
    requirement_type: RequirementType,
    parent: Option<usize>,
    children: Vec<usize>,
    score: Option<f64>,
    valid_score: bool,
    explanation: Option<String>,
    judge_metadata: serde_json::Map<String, serde_json::Value>,
}

/// An immutable-shape, arena-backed rubric tree. The tree's structure
/// (ids, weights, requirement types, parent/child edges) never changes
/// after construction (§3 Data Model: "immutable through agent
/// rollout"); only the judge-populated fields (`score`, `valid_score`,
/// `explanation`, `judge_metadata`) are written, and only through
/// `set_leaf_grade`/`aggregate`.
#[derive(Debug, Clone)]
pub struct RubricTree {
    nodes: Vec<NodeData>,
}

pub const ROOT: usize = 0;

impl RubricTree {
    /// Build the arena from the §6 rubric JSON shape via pre-order DFS.
    /// Node `i`'s children are always indices greater than `i`, so a
    /// reverse scan over `0..nodes.len()` is already a valid bottom-up
    /// (reverse BFS-equivalent) order for aggregation.
    pub fn from_json(root: &TaskNodeJson) -> Result<Self, RubricError> {
        let mut nodes = Vec::new();
        let mut seen_ids = HashSet::new();
        Self::push_node(root, None, &mut nodes, &mut seen_ids)?;
        Ok(Self { nodes })
    }

    fn push_node(
        node: &TaskNodeJson,
        parent: Option<usize>,
        nodes: &mut Vec<NodeData>,
        seen_ids: &mut HashSet<String>,
    ) -> Result<usize, RubricError> {
        if !seen_ids.insert(node.id.clone()) {
            return Err(RubricError::DuplicateId(node.id.clone()));
        }
        let idx = nodes.len();
        nodes.push(NodeData {
            id: node.id.clone(),
            requirements: node.requirements.clone(),
            weight: node.weight,
            requirement_type: node.requirement_type,
            parent,
            children: Vec::new(),
            score: None,
            valid_score: false,
            explanation: None,
            judge_metadata: serde_json::Map::new(),
        });
        for child in &node.sub_nodes {
            let child_idx = Self::push_node(child, Some(idx), nodes, seen_ids)?;
            nodes[idx].children.push(child_idx);
        }
        Ok(idx)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_leaf(&self, idx: usize) -> bool {
        self.nodes[idx].children.is_empty()
    }

    pub fn id(&self, idx: usize) -> &str {
        &self.nodes[idx].id
    }

    pub fn requirements(&self, idx: usize) -> &str {
        &self.nodes[idx].requirements
    }

    pub fn requirement_type(&self, idx: usize) -> RequirementType {
        self.nodes[idx].requirement_type
    }

    pub fn children(&self, idx: usize) -> &[usize] {
        &self.nodes[idx].children
    }

    /// Distance from the root (root itself is depth 0).
    pub fn depth_from_root(&self, idx: usize) -> usize {
        let mut depth = 0;
        let mut cur = idx;
        while let Some(parent) = self.nodes[cur].parent {
            depth += 1;
            cur = parent;
        }
        depth
    }

    /// True leaves of the full (untruncated) tree, in DFS order.
    pub fn leaf_nodes(&self) -> Vec<usize> {
        (0..self.nodes.len()).filter(|&i| self.is_leaf(i)).collect()
    }

    /// Record a leaf-grader result on a specific node (§4.E step 3).
    pub fn set_leaf_grade(&mut self, idx: usize, score: f64, explanation: String) {
        let node = &mut self.nodes[idx];
        node.score = Some(score.clamp(0.0, 1.0));
        node.valid_score = true;
        node.explanation = Some(explanation);
    }

    /// Mark a node's grading as failed (§7 `JudgeLeafError`): score 0,
    /// `valid_score=false`, contributes weight 0 to its parent.
    pub fn set_leaf_invalid(&mut self, idx: usize, explanation: String) {
        let node = &mut self.nodes[idx];
        node.score = Some(0.0);
        node.valid_score = false;
        node.explanation = Some(explanation);
    }

    /// Given an optional `max_depth` (§4.D "Depth truncation"), compute
    /// the set of nodes the judge must call the leaf-grader on directly:
    /// true leaves, plus — when `max_depth` is set — any node exactly
    /// `max_depth` generations below the root, whose own children (if
    /// any) are left ungraded and excluded from the output tree.
    pub fn grading_targets(&self, max_depth: Option<usize>) -> Vec<usize> {
        let mut targets = Vec::new();
        self.collect_targets(ROOT, 0, max_depth, &mut targets);
        targets
    }

    fn collect_targets(&self, idx: usize, depth: usize, max_depth: Option<usize>, targets: &mut Vec<usize>) {
        let truncate_here = matches!(max_depth, Some(d) if depth == d);
        if truncate_here || self.is_leaf(idx) {
            targets.push(idx);
            return;
        }
        for &child in &self.nodes[idx].children {
            self.collect_targets(child, depth + 1, max_depth, targets);
        }
    }

    /// Bottom-up weighted-mean aggregation (§4.D), applied to every
    /// active internal node (an ancestor of some grading target) under
    /// the active `FilterPolicy`. All grading targets must already have
    /// `score`/`valid_score` set via `set_leaf_grade`/`set_leaf_invalid`
    /// before calling this.
    pub fn aggregate(&mut self, max_depth: Option<usize>, policy: &FilterPolicy) {
        let mut targets = Vec::new();
        let mut internal_post_order = Vec::new();
        self.collect_active(ROOT, 0, max_depth, &mut targets, &mut internal_post_order);

        for idx in internal_post_order {
            let filtered_weight_sum: f64 = self.nodes[idx]
                .children
                .iter()
                .filter(|&&c| policy.includes(self, c) && self.nodes[c].valid_score)
                .map(|&c| policy.effective_weight(self, c))
                .sum();

            let weighted_score_sum: f64 = self.nodes[idx]
                .children
                .iter()
                .filter(|&&c| policy.includes(self, c) && self.nodes[c].valid_score)
                .map(|&c| {
                    let w = policy.effective_weight(self, c);
                    let child_score = self.nodes[c].score.unwrap_or(0.0);
                    w * child_score
                })
                .sum();

            let any_valid_positive = self.nodes[idx].children.iter().any(|&c| {
                policy.includes(self, c)
                    && policy.effective_weight(self, c) > 0.0
                    && self.nodes[c].valid_score
            });

            let node = &mut self.nodes[idx];
            if filtered_weight_sum <= 0.0 {
                node.score = Some(0.0);
                node.valid_score = false;
            } else {
                node.score = Some((weighted_score_sum / filtered_weight_sum).clamp(0.0, 1.0));
                node.valid_score = any_valid_positive;
            }
        }
    }

    fn collect_active(
        &self,
        idx: usize,
        depth: usize,
        max_depth: Option<usize>,
        targets: &mut Vec<usize>,
        internal_post_order: &mut Vec<usize>,
    ) {
        let truncate_here = matches!(max_depth, Some(d) if depth == d);
        if truncate_here || self.is_leaf(idx) {
            targets.push(idx);
            return;
        }
        for &child in &self.nodes[idx].children {
            self.collect_active(child, depth + 1, max_depth, targets, internal_post_order);
        }
        internal_post_order.push(idx);
    }

    /// Overall score: the root's score after `aggregate` has run (0 if
    /// the tree is empty or the root was never scored).
    pub fn overall_score(&self) -> f64 {
        if self.nodes.is_empty() {
            return 0.0;
        }
        self.nodes[ROOT].score.unwrap_or(0.0)
    }

    pub fn num_leaf_nodes(&self, max_depth: Option<usize>) -> usize {
        self.grading_targets(max_depth).len()
    }

    pub fn num_invalid_leaf_nodes(&self, max_depth: Option<usize>) -> usize {
        self.grading_targets(max_depth)
            .into_iter()
            .filter(|&idx| !self.nodes[idx].valid_score)
            .count()
    }

    /// Serialize the (possibly truncated) tree into the `GradedTaskNode`
    /// shape written to `grader_output.json`. Nodes beyond `max_depth`
    /// are simply omitted — the truncated node itself is emitted with
    /// an empty `sub_nodes`, matching §8 scenario 5's expectation that
    /// "deeper nodes are absent".
    pub fn to_graded_tree(&self, max_depth: Option<usize>) -> GradedTaskNode {
        self.build_graded(ROOT, 0, max_depth)
    }

    fn build_graded(&self, idx: usize, depth: usize, max_depth: Option<usize>) -> GradedTaskNode {
        let node = &self.nodes[idx];
        let truncate_here = matches!(max_depth, Some(d) if depth == d);
        let sub_nodes = if truncate_here {
            Vec::new()
        } else {
            node.children
                .iter()
                .map(|&c| self.build_graded(c, depth + 1, max_depth))
                .collect()
        };
        GradedTaskNode {
            id: node.id.clone(),
            requirements: node.requirements.clone(),
            weight: node.weight,
            requirement_type: node.requirement_type,
            judge: JudgeFields {
                score: node.score,
                valid_score: node.valid_score,
                explanation: node.explanation.clone(),
                judge_metadata: node.judge_metadata.clone(),
            },
            sub_nodes,
        }
    }
}

/// The filter policy active during aggregation (§4.D). `code_only`
/// excludes non-`code_development` children from both the numerator and
/// denominator of the weighted mean (equivalent to deleting those
/// subtrees, §8's filter-equivalence property). `resources_provided`
/// zeroes the weight of children whose id is in `resource_node_ids`
/// (the "configured list" spec.md §4.D leaves unspecified) without
/// excluding them outright.
#[derive(Debug, Clone, Default)]
pub struct FilterPolicy {
    pub code_only: bool,
    pub resources_provided: bool,
    pub resource_node_ids: HashSet<String>,
}

impl FilterPolicy {
    pub fn includes(&self, tree: &RubricTree, idx: usize) -> bool {
        if self.code_only && tree.requirement_type(idx) != RequirementType::CodeDevelopment {
            return false;
        }
        true
    }

    pub fn effective_weight(&self, tree: &RubricTree, idx: usize) -> f64 {
        if self.resources_provided && self.resource_node_ids.contains(tree.id(idx)) {
            return 0.0;
        }
        tree.nodes_weight(idx)
    }
}

impl RubricTree {
    fn nodes_weight(&self, idx: usize) -> f64 {
        self.nodes[idx].weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(id: &str, weight: f64, rt: RequirementType) -> TaskNodeJson {
        TaskNodeJson {
            id: id.to_string(),
            requirements: format!("requirement {id}"),
            weight,
            requirement_type: rt,
            sub_nodes: vec![],
        }
    }

    #[test]
    fn empty_rubric_scores_zero() {
        let root = leaf("root", 1.0, RequirementType::Other);
        let mut tree = RubricTree::from_json(&root).unwrap();
        tree.set_leaf_grade(ROOT, 0.0, "n/a".into());
        tree.aggregate(None, &FilterPolicy::default());
        assert_eq!(tree.overall_score(), 0.0);
        assert_eq!(tree.num_leaf_nodes(None), 1);
        assert_eq!(tree.num_invalid_leaf_nodes(None), 0);
    }

    #[test]
    fn weighted_mean_over_two_leaves() {
        let root = TaskNodeJson {
            id: "root".into(),
            requirements: "root".into(),
            weight: 1.0,
            requirement_type: RequirementType::Other,
            sub_nodes: vec![
                leaf("a", 1.0, RequirementType::CodeDevelopment),
                leaf("b", 1.0, RequirementType::CodeDevelopment),
            ],
        };
        let mut tree = RubricTree::from_json(&root).unwrap();
        let targets = tree.grading_targets(None);
        assert_eq!(targets.len(), 2);
        tree.set_leaf_grade(targets[0], 1.0, "ok".into());
        tree.set_leaf_grade(targets[1], 0.0, "fail".into());
        tree.aggregate(None, &FilterPolicy::default());
        assert_eq!(tree.overall_score(), 0.5);
    }

    #[test]
    fn zero_weight_siblings_mark_parent_invalid() {
        let root = TaskNodeJson {
            id: "root".into(),
            requirements: "root".into(),
            weight: 1.0,
            requirement_type: RequirementType::Other,
            sub_nodes: vec![leaf("a", 0.0, RequirementType::Other), leaf("b", 0.0, RequirementType::Other)],
        };
        let mut tree = RubricTree::from_json(&root).unwrap();
        for &idx in &tree.grading_targets(None) {
            tree.set_leaf_grade(idx, 1.0, "ok".into());
        }
        tree.aggregate(None, &FilterPolicy::default());
        assert_eq!(tree.overall_score(), 0.0);
        assert!(!tree.nodes[ROOT].valid_score);
    }

    /// §4.D: "Leaf nodes are invalid... they contribute weight 0 to the
    /// parent." An invalid sibling must be excluded from the weighted
    /// mean's denominator entirely, not merely zeroed in the numerator —
    /// otherwise its nominal weight still dilutes the valid sibling's
    /// average.
    #[test]
    fn invalid_sibling_is_excluded_from_weighted_mean_denominator() {
        let root = TaskNodeJson {
            id: "root".into(),
            requirements: "root".into(),
            weight: 1.0,
            requirement_type: RequirementType::Other,
            sub_nodes: vec![leaf("a", 0.5, RequirementType::Other), leaf("b", 0.5, RequirementType::Other)],
        };
        let mut tree = RubricTree::from_json(&root).unwrap();
        let targets = tree.grading_targets(None);
        tree.set_leaf_grade(targets[0], 1.0, "ok".into());
        tree.set_leaf_invalid(targets[1], "judge failed".into());
        tree.aggregate(None, &FilterPolicy::default());
        assert_eq!(tree.overall_score(), 1.0);
        assert!(tree.nodes[ROOT].valid_score);
    }

    #[test]
    fn code_only_filter_matches_subtree_deletion() {
        let root = TaskNodeJson {
            id: "root".into(),
            requirements: "root".into(),
            weight: 1.0,
            requirement_type: RequirementType::Other,
            sub_nodes: vec![
                leaf("code", 1.0, RequirementType::CodeDevelopment),
                leaf("other", 1.0, RequirementType::ResultMatch),
            ],
        };
        let mut with_filter = RubricTree::from_json(&root).unwrap();
        for &idx in &with_filter.grading_targets(None) {
            with_filter.set_leaf_grade(idx, 1.0, "ok".into());
        }
        let policy = FilterPolicy {
            code_only: true,
            ..Default::default()
        };
        with_filter.aggregate(None, &policy);

        let pruned_root = TaskNodeJson {
            id: "root".into(),
            requirements: "root".into(),
            weight: 1.0,
            requirement_type: RequirementType::Other,
            sub_nodes: vec![leaf("code", 1.0, RequirementType::CodeDevelopment)],
        };
        let mut pruned = RubricTree::from_json(&pruned_root).unwrap();
        for &idx in &pruned.grading_targets(None) {
            pruned.set_leaf_grade(idx, 1.0, "ok".into());
        }
        pruned.aggregate(None, &FilterPolicy::default());

        assert_eq!(with_filter.overall_score(), pruned.overall_score());
    }

    #[test]
    fn resources_provided_zeroes_weight_without_excluding() {
        let root = TaskNodeJson {
            id: "root".into(),
            requirements: "root".into(),
            weight: 1.0,
            requirement_type: RequirementType::Other,
            sub_nodes: vec![
                leaf("download_dataset", 1.0, RequirementType::Other),
                leaf("train_model", 1.0, RequirementType::CodeExecution),
            ],
        };
        let mut tree = RubricTree::from_json(&root).unwrap();
        let targets = tree.grading_targets(None);
        tree.set_leaf_grade(targets[0], 1.0, "n/a, should be zeroed".into());
        tree.set_leaf_grade(targets[1], 0.6, "ok".into());

        let mut resource_ids = HashSet::new();
        resource_ids.insert("download_dataset".to_string());
        let policy = FilterPolicy {
            resources_provided: true,
            resource_node_ids: resource_ids,
            ..Default::default()
        };
        tree.aggregate(None, &policy);
        assert_eq!(tree.overall_score(), 0.6);
    }

    #[test]
    fn depth_truncation_yields_depth_2_leaves() {
        // root -> a -> b -> c(leaf)   (depth 3 leaf)
        let root = TaskNodeJson {
            id: "root".into(),
            requirements: String::new(),
            weight: 1.0,
            requirement_type: RequirementType::Other,
            sub_nodes: vec![TaskNodeJson {
                id: "a".into(),
                requirements: String::new(),
                weight: 1.0,
                requirement_type: RequirementType::Other,
                sub_nodes: vec![TaskNodeJson {
                    id: "b".into(),
                    requirements: String::new(),
                    weight: 1.0,
                    requirement_type: RequirementType::Other,
                    sub_nodes: vec![leaf("c", 1.0, RequirementType::Other)],
                }],
            }],
        };
        let tree = RubricTree::from_json(&root).unwrap();
        let targets = tree.grading_targets(Some(2));
        assert_eq!(targets.len(), 1);
        assert_eq!(tree.id(targets[0]), "b");
        assert_eq!(tree.depth_from_root(targets[0]), 2);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let root = TaskNodeJson {
            id: "root".into(),
            requirements: String::new(),
            weight: 1.0,
            requirement_type: RequirementType::Other,
            sub_nodes: vec![leaf("x", 1.0, RequirementType::Other), leaf("x", 1.0, RequirementType::Other)],
        };
        assert!(matches!(RubricTree::from_json(&root), Err(RubricError::DuplicateId(_))));
    }
}
