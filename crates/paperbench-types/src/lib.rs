//! Shared data model for the PaperBench evaluation orchestrator:
//! rubric wire shapes, run artifacts, grade records, and configuration
//! structs used across the workspace.

pub mod config;
pub mod eval_run;
pub mod result;
pub mod rubric;
pub mod run_record;

pub use config::{
    parse_yaml_config, ConfigError, EvalFileConfig, JudgeConfig, MonitorConfig, NetworkMode,
    ReproductionConfig, SchedulerConfig,
};
pub use eval_run::EvalRun;
pub use result::{
    AgentOutput, JudgeOutput, MonitorFinding, MonitorResult, PaperBenchResult,
    ReproductionMetadata, ReproScriptRunOutcome, TokenUsage,
};
pub use rubric::{GradedTaskNode, JudgeFields, RequirementType, TaskNodeJson};
pub use run_record::{RunMetadata, RunRecordPaths, SnapshotLog, StatusFile};
