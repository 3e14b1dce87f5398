mod paper_registry;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use paperbench_blobstore::{BlobStore, LocalBlobStore};
use paperbench_judge::{DummyScaffold, JudgeEngine, JudgeScaffold, RandomScaffold, SimpleScaffold};
use paperbench_monitor::{BasicMonitorStrategy, Monitor};
use paperbench_observability::{init_logging, ProcessKind};
use paperbench_orchestrator::{submission_view_from_tar_gz, OrchestratorConfig, TaskOrchestrator};
use paperbench_providers::{CompleterConfig, HttpTurnCompleter};
use paperbench_sandbox::LocalProcessRuntime;
use paperbench_scheduler::EvaluationScheduler;
use paperbench_solver::BasicAgentSolver;
use paperbench_types::{parse_yaml_config, EvalFileConfig, JudgeConfig, MonitorConfig, SchedulerConfig};
use tokio_util::sync::CancellationToken;

use paper_registry::FileSystemPaperProvider;

#[derive(Parser, Debug)]
#[command(name = "paperbench-engine")]
#[command(about = "Evaluation scheduler, standalone judge, and post-hoc monitor for ML paper reproductions")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a full evaluation over a paper split (§4.I).
    RunEval {
        /// Optional YAML config file (§10.3); the flags below override
        /// whatever it sets, field by field.
        #[arg(long, env = "PAPERBENCH_CONFIG")]
        config: Option<String>,
        #[arg(long, env = "PAPERBENCH_PAPER_SPLIT")]
        paper_split: String,
        #[arg(long, env = "PAPERBENCH_N_TRIES")]
        n_tries: Option<usize>,
        #[arg(long, env = "PAPERBENCH_RUNS_DIR")]
        runs_dir: Option<String>,
        #[arg(long, env = "PAPERBENCH_CONCURRENCY")]
        concurrency: Option<usize>,
        #[arg(long, env = "PAPERBENCH_RESUME_GROUP")]
        resume_group: Option<String>,
        #[arg(long, default_value_t = false, env = "PAPERBENCH_RESUME_NO_EXTEND")]
        resume_no_extend: bool,
        #[arg(long, env = "PAPERBENCH_TARGET_DURATION_HR")]
        target_duration_hr: Option<u32>,
        #[arg(long, default_value_t = false, env = "PAPERBENCH_SKIP_REPRODUCTION")]
        skip_reproduction: bool,
        #[arg(long, default_value_t = false, env = "PAPERBENCH_CODE_ONLY")]
        code_only: bool,
        #[arg(long, default_value_t = false, env = "PAPERBENCH_RESOURCES_PROVIDED")]
        resources_provided: bool,
        #[arg(long, env = "PAPERBENCH_PAPERS_DIR")]
        papers_dir: Option<String>,
        #[arg(long, env = "PAPERBENCH_JUDGE_SCAFFOLD")]
        judge: Option<String>,
        #[arg(long, env = "PAPERBENCH_DOCKER_IMAGE")]
        docker_image: Option<String>,
    },
    /// Grade one submission archive against one paper's rubric,
    /// outside the scheduler/orchestrator entirely (§4.E).
    RunJudge {
        /// Optional YAML config file deserializing directly into
        /// `JudgeConfig` (§10.3); the flags below override it.
        #[arg(long, env = "PAPERBENCH_CONFIG")]
        config: Option<String>,
        #[arg(long, env = "PAPERBENCH_SUBMISSION_PATH")]
        submission_path: String,
        #[arg(long, env = "PAPERBENCH_PAPER_ID")]
        paper_id: String,
        #[arg(long, env = "PAPERBENCH_JUDGE_SCAFFOLD")]
        judge: Option<String>,
        #[arg(long, env = "PAPERBENCH_MAX_DEPTH")]
        max_depth: Option<usize>,
        #[arg(long, default_value = ".", env = "PAPERBENCH_OUT_DIR")]
        out_dir: String,
        #[arg(long, default_value_t = false, env = "PAPERBENCH_CODE_ONLY")]
        code_only: bool,
        #[arg(long, default_value_t = false, env = "PAPERBENCH_RESOURCES_PROVIDED")]
        resources_provided: bool,
        #[arg(long, default_value = "papers", env = "PAPERBENCH_PAPERS_DIR")]
        papers_dir: String,
    },
    /// Scan existing run groups for policy violations (§4.K).
    RunMonitor {
        #[arg(long, default_value = "runs", env = "PAPERBENCH_LOGS_DIR")]
        logs_dir: String,
        #[arg(long, env = "PAPERBENCH_RUN_GROUPS", value_delimiter = ',')]
        run_groups: Vec<String>,
        #[arg(long, default_value = "monitor_reports", env = "PAPERBENCH_OUT_DIR")]
        out_dir: String,
    },
}

fn build_scaffold(name: &str) -> Result<Arc<dyn JudgeScaffold>> {
    match name {
        "dummy" => Ok(Arc::new(DummyScaffold)),
        "random" => Ok(Arc::new(RandomScaffold)),
        "simple" => Ok(Arc::new(SimpleScaffold::new(HttpTurnCompleter::new(CompleterConfig::default())))),
        other => bail!("unknown judge scaffold: {other} (expected dummy, random, or simple)"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let process_kind = match &cli.command {
        Command::RunEval { .. } => ProcessKind::Eval,
        Command::RunJudge { .. } => ProcessKind::Judge,
        Command::RunMonitor { .. } => ProcessKind::Monitor,
    };
    init_logging(process_kind).ok();

    let exit_code = match cli.command {
        Command::RunEval {
            config,
            paper_split,
            n_tries,
            runs_dir,
            concurrency,
            resume_group,
            resume_no_extend,
            target_duration_hr,
            skip_reproduction,
            code_only,
            resources_provided,
            papers_dir,
            judge,
            docker_image,
        } => {
            run_eval(RunEvalArgs {
                config,
                paper_split,
                n_tries,
                runs_dir,
                concurrency,
                resume_group,
                resume_no_extend,
                target_duration_hr,
                skip_reproduction,
                code_only,
                resources_provided,
                papers_dir,
                judge,
                docker_image,
            })
            .await?
        }
        Command::RunJudge {
            config,
            submission_path,
            paper_id,
            judge,
            max_depth,
            out_dir,
            code_only,
            resources_provided,
            papers_dir,
        } => {
            run_judge(RunJudgeArgs {
                config,
                submission_path,
                paper_id,
                judge,
                max_depth,
                out_dir,
                code_only,
                resources_provided,
                papers_dir,
            })
            .await?
        }
        Command::RunMonitor { logs_dir, run_groups, out_dir } => run_monitor(logs_dir, run_groups, out_dir).await?,
    };

    std::process::exit(exit_code);
}

struct RunEvalArgs {
    config: Option<String>,
    paper_split: String,
    n_tries: Option<usize>,
    runs_dir: Option<String>,
    concurrency: Option<usize>,
    resume_group: Option<String>,
    resume_no_extend: bool,
    target_duration_hr: Option<u32>,
    skip_reproduction: bool,
    code_only: bool,
    resources_provided: bool,
    papers_dir: Option<String>,
    judge: Option<String>,
    docker_image: Option<String>,
}

/// Loads the `--config` YAML overlay if one was given, else the default
/// (every section of `EvalFileConfig` already falls back to its own
/// `Default`). Returns `Err` only on a malformed file; the caller maps
/// that to exit code 1.
fn load_eval_file_config(path: &Option<String>) -> Result<EvalFileConfig> {
    match path {
        Some(path) => {
            let bytes = std::fs::read(path).with_context(|| format!("reading config file at {path}"))?;
            parse_yaml_config(&bytes).with_context(|| format!("parsing config file at {path}"))
        }
        None => Ok(EvalFileConfig::default()),
    }
}

/// Exit codes follow §6/§7: 0 success, 1 invalid config, 2 partial
/// failures recorded in the summary, 3 unrecoverable system error.
async fn run_eval(args: RunEvalArgs) -> Result<i32> {
    let file_config = match load_eval_file_config(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            return Ok(1);
        }
    };

    // CLI flags are applied last, field by field, over whatever the
    // config file set (§10.3); flags with no explicit value leave the
    // file's (or that struct's `Default`) setting untouched.
    let mut scheduler_config = file_config.scheduler;
    scheduler_config.paper_split = args.paper_split.clone();
    if let Some(n_tries) = args.n_tries {
        scheduler_config.n_tries = n_tries;
    }
    if let Some(runs_dir) = &args.runs_dir {
        scheduler_config.runs_dir = runs_dir.clone();
    }
    if let Some(concurrency) = args.concurrency {
        scheduler_config.concurrency = concurrency;
    }
    if args.resume_group.is_some() {
        scheduler_config.resume_run_group_id = args.resume_group.clone();
    }
    if args.resume_no_extend {
        scheduler_config.resume_no_extend = true;
    }
    if args.target_duration_hr.is_some() {
        scheduler_config.target_duration_hr = args.target_duration_hr;
    }
    if let Some(docker_image) = &args.docker_image {
        scheduler_config.docker_image = docker_image.clone();
    }
    if let Err(err) = scheduler_config.validate() {
        eprintln!("invalid configuration: {err}");
        return Ok(1);
    }

    let papers_dir = args.papers_dir.clone().unwrap_or_else(|| "papers".to_string());
    let judge_scaffold = args.judge.clone().unwrap_or_else(|| "simple".to_string());

    let provider = FileSystemPaperProvider::new(&papers_dir);
    let split = match provider.load_split(&args.paper_split) {
        Ok(split) => split,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            return Ok(1);
        }
    };

    let scaffold = build_scaffold(&judge_scaffold)?;
    let store: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(PathBuf::from(".")));
    let runtime = Arc::new(LocalProcessRuntime::new());
    let solver_completer_config = CompleterConfig {
        api_key_env_var: "AGENT_OPENAI_API_KEY".to_string(),
        ..Default::default()
    };
    let solver = Arc::new(BasicAgentSolver::new(HttpTurnCompleter::new(solver_completer_config)));
    let judge_engine = Arc::new(JudgeEngine::new(scaffold));

    let mut orchestrator_config = OrchestratorConfig {
        runs_dir: scheduler_config.runs_dir.clone(),
        agent_docker_image: scheduler_config.docker_image.clone(),
        resume: args.resume_group.is_some(),
        reproduction: file_config.reproduction,
        judge: file_config.judge,
        target_duration_hr: scheduler_config.target_duration_hr,
        ..Default::default()
    };
    if args.skip_reproduction {
        orchestrator_config.reproduction.skip_reproduction = true;
    }
    if args.code_only {
        orchestrator_config.judge.code_only = true;
    }
    if args.resources_provided {
        orchestrator_config.judge.resources_provided = true;
    }

    let orchestrator = Arc::new(TaskOrchestrator::new(runtime, Arc::clone(&store), solver, judge_engine, orchestrator_config));
    let scheduler = EvaluationScheduler::new(orchestrator, Arc::clone(&store), scheduler_config);

    let group_id = args.resume_group.clone().unwrap_or_else(|| format!("{}_{}", args.paper_split, chrono::Utc::now().format("%Y%m%dT%H%M%SZ")));

    let (summary, _results) = match scheduler.run_split(&split, &group_id, &provider, CancellationToken::new()).await {
        Ok(outcome) => outcome,
        // A `ConfigError` (bad split, missing paper, malformed rubric)
        // is a fail-fast condition (§7): exit 1, not the generic
        // unrecoverable-system-error exit 3.
        Err(paperbench_scheduler::SchedulerError::Config(err)) => {
            eprintln!("invalid configuration: {err}");
            return Ok(1);
        }
        Err(err) => {
            eprintln!("unrecoverable scheduler error: {err}");
            return Ok(3);
        }
    };

    if let Err(err) = scheduler.write_summary(&group_id, &summary).await {
        eprintln!("failed to write summary: {err}");
        return Ok(3);
    }

    println!("{}", serde_json::to_string_pretty(&summary).expect("EvalSummary always serializes"));

    if summary.n_system_errors > 0 {
        return Ok(3);
    }
    if summary.n_rollouts_failed > 0 || summary.n_reproductions_failed > 0 || summary.n_gradings_failed > 0 {
        return Ok(2);
    }
    Ok(0)
}

struct RunJudgeArgs {
    config: Option<String>,
    submission_path: String,
    paper_id: String,
    judge: Option<String>,
    max_depth: Option<usize>,
    out_dir: String,
    code_only: bool,
    resources_provided: bool,
    papers_dir: String,
}

async fn run_judge(args: RunJudgeArgs) -> Result<i32> {
    let provider = FileSystemPaperProvider::new(&args.papers_dir);
    let rubric = match provider.load_rubric(&args.paper_id) {
        Ok(rubric) => rubric,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            return Ok(1);
        }
    };

    let tar_gz = tokio::fs::read(&args.submission_path)
        .await
        .with_context(|| format!("reading submission archive at {}", args.submission_path))?;
    let submission = submission_view_from_tar_gz(&tar_gz).unwrap_or_default();

    let mut config = match &args.config {
        Some(path) => {
            let bytes = std::fs::read(path).with_context(|| format!("reading config file at {path}"))?;
            match parse_yaml_config::<JudgeConfig>(&bytes) {
                Ok(config) => config,
                Err(err) => {
                    eprintln!("invalid configuration: {err}");
                    return Ok(1);
                }
            }
        }
        None => JudgeConfig::default(),
    };
    let judge_scaffold = args.judge.clone().unwrap_or_else(|| config.scaffold.clone());
    if let Some(max_depth) = args.max_depth {
        config.max_depth = Some(max_depth);
    }
    if args.code_only {
        config.code_only = true;
    }
    if args.resources_provided {
        config.resources_provided = true;
    }

    let scaffold = build_scaffold(&judge_scaffold)?;
    let engine = JudgeEngine::new(scaffold);

    let output = match engine.grade(&args.paper_id, &rubric, &submission, &config, serde_json::json!({}), CancellationToken::new()).await {
        Ok(output) => output,
        Err(err) => {
            eprintln!("unrecoverable judge error: {err}");
            return Ok(3);
        }
    };

    let store = LocalBlobStore::new(PathBuf::from(&args.out_dir));
    paperbench_judge::write_grader_output(&store, "grader_output.json", &output).await?;
    println!("{}", serde_json::to_string_pretty(&output).expect("JudgeOutput always serializes"));

    Ok(if output.success() { 0 } else { 2 })
}

async fn run_monitor(logs_dir: String, run_groups: Vec<String>, out_dir: String) -> Result<i32> {
    let store = LocalBlobStore::new(PathBuf::from("."));
    let monitor = Monitor::new(&store, Arc::new(BasicMonitorStrategy::default()));
    let config = MonitorConfig { logs_dir, run_groups, out_dir: out_dir.clone() };

    let report = match monitor.scan(&config).await {
        Ok(report) => report,
        Err(err) => {
            eprintln!("unrecoverable monitor error: {err}");
            return Ok(3);
        }
    };

    let filename = format!("monitor_results_{}.json", chrono::Utc::now().format("%Y%m%d_%H%M%S"));
    let path = format!("{}/{}", out_dir.trim_end_matches('/'), filename);
    let bytes = serde_json::to_vec_pretty(&report).expect("MonitorReport always serializes");
    store.write(&path, &bytes).await?;
    println!("wrote {path}");

    Ok(0)
}
