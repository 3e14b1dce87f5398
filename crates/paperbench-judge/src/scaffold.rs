//! The scaffold is the strategy that turns (leaf, context) into
//! (score, explanation) (§4.E). Everything else in the engine —
//! dispatch, pooling, aggregation, the output writer — is shared across
//! scaffolds.

use async_trait::async_trait;
use paperbench_providers::{ChatTurn, CompletionError, TokenUsage, TurnCompleter};
use rand::Rng;

pub struct LeafContext<'a> {
    pub paper_id: &'a str,
    pub node_id: &'a str,
    pub requirements: &'a str,
    pub submission_excerpt: &'a str,
}

#[derive(Debug, Clone)]
pub struct LeafGrade {
    pub score: f64,
    pub explanation: String,
    pub valid_score: bool,
    pub usage: Option<TokenUsage>,
}

#[async_trait]
pub trait JudgeScaffold: Send + Sync {
    fn judge_type(&self) -> &'static str;

    async fn grade_leaf(&self, context: &LeafContext<'_>) -> LeafGrade;
}

/// Fixed zero score, for plumbing tests (§4.E).
pub struct DummyScaffold;

#[async_trait]
impl JudgeScaffold for DummyScaffold {
    fn judge_type(&self) -> &'static str {
        "dummy"
    }

    async fn grade_leaf(&self, _context: &LeafContext<'_>) -> LeafGrade {
        LeafGrade {
            score: 0.0,
            explanation: "dummy scaffold always returns zero".to_string(),
            valid_score: true,
            usage: None,
        }
    }
}

/// Uniform score in [0,1], for statistical tests (§4.E).
pub struct RandomScaffold;

#[async_trait]
impl JudgeScaffold for RandomScaffold {
    fn judge_type(&self) -> &'static str {
        "random"
    }

    async fn grade_leaf(&self, _context: &LeafContext<'_>) -> LeafGrade {
        let score = rand::thread_rng().gen_range(0.0..=1.0);
        LeafGrade {
            score,
            explanation: "random scaffold".to_string(),
            valid_score: true,
            usage: None,
        }
    }
}

/// Completer-driven scaffold: builds a judge prompt from the paper id,
/// leaf requirements, and a submission excerpt, then asks the completer
/// for a `{score, explanation}` reply.
pub struct SimpleScaffold<C: TurnCompleter> {
    completer: C,
}

impl<C: TurnCompleter> SimpleScaffold<C> {
    pub fn new(completer: C) -> Self {
        Self { completer }
    }

    fn parse_reply(content: &str) -> Result<(f64, String), CompletionError> {
        let value: serde_json::Value = serde_json::from_str(content.trim())
            .map_err(|e| CompletionError::Unparseable(e.to_string()))?;
        let score = value
            .get("score")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| CompletionError::Unparseable("missing numeric score".to_string()))?;
        let explanation = value
            .get("explanation")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        Ok((score.clamp(0.0, 1.0), explanation))
    }
}

#[async_trait]
impl<C: TurnCompleter> JudgeScaffold for SimpleScaffold<C> {
    fn judge_type(&self) -> &'static str {
        "simple"
    }

    async fn grade_leaf(&self, context: &LeafContext<'_>) -> LeafGrade {
        let prompt = ChatTurn {
            role: "user".to_string(),
            content: format!(
                "Paper: {}\nRequirement ({}): {}\nSubmission excerpt:\n{}\n\nReply with JSON {{\"score\": <0..1>, \"explanation\": <str>}}.",
                context.paper_id, context.node_id, context.requirements, context.submission_excerpt
            ),
        };
        match self.completer.complete(&[prompt]).await {
            Ok(reply) => match Self::parse_reply(&reply.content) {
                Ok((score, explanation)) => LeafGrade {
                    score,
                    explanation,
                    valid_score: true,
                    usage: Some(reply.usage),
                },
                Err(err) => {
                    tracing::warn!(node_id = context.node_id, error = %err, "judge reply unparseable");
                    LeafGrade {
                        score: 0.0,
                        explanation: format!("unparseable completer reply: {err}"),
                        valid_score: false,
                        usage: Some(reply.usage),
                    }
                }
            },
            Err(err) => {
                tracing::warn!(node_id = context.node_id, error = %err, "judge completer call failed");
                LeafGrade {
                    score: 0.0,
                    explanation: format!("completer error: {err}"),
                    valid_score: false,
                    usage: None,
                }
            }
        }
    }
}
