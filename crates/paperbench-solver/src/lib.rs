//! Agent Solver contract (spec §4.G). The solver's own prompt
//! assembly and tool schemas are out of scope (spec.md §1, "external
//! collaborators"); what this crate fixes is the *contract* between
//! the solver and the rest of the core: it consumes a
//! `ComputerConfiguration` and instruction prompt, emits no RunRecord
//! writes of its own (those happen solely through
//! `paperbench-snapshot`), terminates on submit/step-limit/wall-clock/
//! cancellation, returns an `AgentOutput`, and prunes conversation
//! history on context overflow by dropping the oldest ~30% of
//! non-system messages while preserving the initial instruction and
//! every tool_call/tool_result pair's integrity.

pub mod pruning;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use paperbench_providers::{ChatTurn, TurnCompleter};
use paperbench_sandbox::ReleasableSandbox;
use paperbench_snapshot::AgentProgress;
use paperbench_types::{AgentOutput, NetworkMode};
use tokio_util::sync::CancellationToken;

pub use pruning::{prune_context, Message, Role};

/// Parameters the orchestrator hands the solver at AGENT start (§4.G
/// "Consume a `ComputerConfiguration`").
#[derive(Debug, Clone)]
pub struct ComputerConfiguration {
    pub docker_image: String,
    pub network_mode: NetworkMode,
}

#[derive(Debug, Clone)]
pub struct SolverConfig {
    pub step_limit: u64,
    pub wall_clock_budget: Duration,
    /// Trigger context pruning once the running history exceeds this
    /// many messages; a stand-in for a real token-based overflow signal
    /// since this core does not implement token counting itself.
    pub context_window_messages: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            step_limit: 500,
            wall_clock_budget: Duration::from_secs(3 * 3600),
            context_window_messages: 200,
        }
    }
}

/// One of the four termination reasons §4.G fixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    Submitted,
    StepLimit,
    WallClockLimit,
    Cancelled,
}

#[async_trait]
pub trait AgentSolver: Send + Sync {
    async fn run(
        &self,
        sandbox: &ReleasableSandbox,
        progress: &AgentProgress,
        run_id: &str,
        instructions: &str,
        config: &SolverConfig,
        cancel: CancellationToken,
    ) -> AgentOutput;
}

/// Writes a trivial `reproduce.sh` and returns immediately (§8 scenario
/// 1, "Agent writes a trivial reproduce.sh"). Used for plumbing tests
/// of the orchestrator/scheduler that do not need a real solver loop.
pub struct DummySolver;

#[async_trait]
impl AgentSolver for DummySolver {
    async fn run(
        &self,
        sandbox: &ReleasableSandbox,
        progress: &AgentProgress,
        run_id: &str,
        _instructions: &str,
        _config: &SolverConfig,
        _cancel: CancellationToken,
    ) -> AgentOutput {
        let time_start = Utc::now().timestamp() as f64;
        let _ = sandbox
            .exec("mkdir -p submission logs", true)
            .await;
        let _ = sandbox
            .upload(b"#!/bin/bash\necho 'nothing to reproduce'\n", "submission/reproduce.sh")
            .await;
        progress.record_step();
        let time_end = Utc::now().timestamp() as f64;
        AgentOutput {
            run_id: run_id.to_string(),
            time_start,
            time_end,
            runtime_in_seconds: (time_end - time_start).max(0.0),
            error_message: None,
            status_exists: true,
        }
    }
}

/// Tool-using loop over a `TurnCompleter` (§4.G). Each iteration sends
/// the pruned running history to the completer and checks its reply
/// for the literal marker `SUBMIT` (a stand-in for the real submit tool
/// call, whose schema is out of scope here) to decide whether the
/// agent is done. Termination is cooperative: the loop checks `cancel`,
/// the step limit, and the wall-clock budget once per iteration rather
/// than mid-completer-call.
pub struct BasicAgentSolver<C: TurnCompleter> {
    completer: C,
}

impl<C: TurnCompleter> BasicAgentSolver<C> {
    pub fn new(completer: C) -> Self {
        Self { completer }
    }
}

#[async_trait]
impl<C: TurnCompleter + Send + Sync> AgentSolver for BasicAgentSolver<C> {
    async fn run(
        &self,
        sandbox: &ReleasableSandbox,
        progress: &AgentProgress,
        run_id: &str,
        instructions: &str,
        config: &SolverConfig,
        cancel: CancellationToken,
    ) -> AgentOutput {
        let start = Instant::now();
        let time_start = Utc::now().timestamp() as f64;
        let mut history = vec![Message {
            role: Role::System,
            content: instructions.to_string(),
            pair_id: None,
        }];

        let mut error_message = None;
        let mut reason = TerminationReason::StepLimit;

        loop {
            if cancel.is_cancelled() {
                reason = TerminationReason::Cancelled;
                break;
            }
            if start.elapsed() >= config.wall_clock_budget {
                reason = TerminationReason::WallClockLimit;
                break;
            }
            if progress.step_count() >= config.step_limit {
                reason = TerminationReason::StepLimit;
                break;
            }
            if history.len() > config.context_window_messages {
                history = prune_context(&history);
            }

            let turns: Vec<ChatTurn> = history
                .iter()
                .map(|m| ChatTurn {
                    role: m.role.as_str().to_string(),
                    content: m.content.clone(),
                })
                .collect();

            let reply = tokio::select! {
                reply = self.completer.complete(&turns) => reply,
                _ = cancel.cancelled() => {
                    reason = TerminationReason::Cancelled;
                    break;
                }
            };

            match reply {
                Ok(reply) => {
                    let submitted = reply.content.contains("SUBMIT");
                    history.push(Message {
                        role: Role::Assistant,
                        content: reply.content,
                        pair_id: None,
                    });
                    progress.record_step();
                    if submitted {
                        let _ = sandbox.exec("mkdir -p submission logs", true).await;
                        reason = TerminationReason::Submitted;
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!(run_id, error = %err, "completer call failed, ending rollout");
                    error_message = Some(format!("completer error: {err}"));
                    break;
                }
            }
        }

        tracing::info!(run_id, ?reason, steps = progress.step_count(), "agent rollout finished");
        let time_end = Utc::now().timestamp() as f64;
        AgentOutput {
            run_id: run_id.to_string(),
            time_start,
            time_end,
            runtime_in_seconds: (time_end - time_start).max(0.0),
            error_message,
            status_exists: true,
        }
    }
}
