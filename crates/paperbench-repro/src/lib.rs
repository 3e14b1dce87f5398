//! Reproduction Runner (spec §4.F): re-executes `reproduce.sh` against
//! the agent's final submission in a clean sandbox and records the
//! outcome, including one optional salvage retry.

use std::time::{Duration, Instant};

use chrono::Utc;
use paperbench_sandbox::{ReleasableSandbox, SandboxConfig, SandboxError, SandboxHandle, SandboxRuntime};
use paperbench_types::{ReproScriptRunOutcome, ReproductionConfig, ReproductionMetadata};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReproductionError {
    #[error("failed to lease reproduction sandbox: {0}")]
    SandboxLease(#[from] SandboxError),
}

pub struct ReproductionRunner<'a, R: SandboxRuntime> {
    runtime: &'a R,
}

impl<'a, R: SandboxRuntime> ReproductionRunner<'a, R> {
    pub fn new(runtime: &'a R) -> Self {
        Self { runtime }
    }

    /// Skip mode (§4.F "Skip mode"): no sandbox lease, empty metadata.
    pub fn skip() -> ReproductionMetadata {
        ReproductionMetadata {
            is_valid_git_repo: false,
            git_log: String::new(),
            repro_script_exists: false,
            files_before_reproduce: String::new(),
            files_after_reproduce: String::new(),
            timedout: false,
            repro_log: String::new(),
            retried_results: Vec::new(),
            repro_execution_time: None,
            git_status_after_reproduce: None,
            executed_submission: None,
        }
    }

    /// Runs the full 9-step protocol (§4.F operations 1-9).
    pub async fn run(
        &self,
        submission_tar_gz: &[u8],
        config: &ReproductionConfig,
    ) -> Result<ReproductionMetadata, ReproductionError> {
        let sandbox_config = SandboxConfig {
            docker_image: config.docker_image.clone(),
            network_mode: config.network_mode,
            ..Default::default()
        };
        let handle = self.runtime.lease(&sandbox_config).await?;
        let sandbox = ReleasableSandbox::new(handle);

        let outcome = self.run_inner(&sandbox, submission_tar_gz, config).await;
        sandbox.release().await;
        Ok(outcome)
    }

    async fn run_inner(
        &self,
        sandbox: &ReleasableSandbox,
        submission_tar_gz: &[u8],
        config: &ReproductionConfig,
    ) -> ReproductionMetadata {
        // Step 2: stream the archive in, extract it to a collision-free
        // staging directory, then deterministically move its
        // `submission/` entry to the canonical `/submission` path
        // (spec.md §6; mirrors the original's
        // `computer_utils.py::put_submission_in_computer`). Real
        // archives always nest the agent's files under a top-level
        // `submission/` prefix (§4.C's snapshot tar command, §3's
        // Submission entity), so extracting straight to `/submission`
        // would leave everything doubly nested at
        // `/submission/submission/...`.
        if let Err(err) = sandbox.upload(submission_tar_gz, "/submission.tar.gz").await {
            tracing::warn!(error = %err, "failed to upload submission archive");
        }
        let _ = sandbox
            .exec(
                "staging=$(mktemp -d) && tar -xzf /submission.tar.gz -C \"$staging\" && rm -rf /submission && mv \"$staging/submission\" /submission",
                true,
            )
            .await;

        // Step 3: snapshot before.
        let files_before_reproduce = self.list_files(sandbox).await;

        // Step 4: git init + validity + log.
        let _ = sandbox
            .exec(
                "cd /submission && ( [ -d .git ] || git init -q )",
                false,
            )
            .await;
        let is_valid_git_repo = sandbox
            .exec("cd /submission && git rev-parse --is-inside-work-tree", true)
            .await
            .map(|o| o.success())
            .unwrap_or(false);
        let git_log = sandbox
            .exec("cd /submission && git log --oneline -n 50", true)
            .await
            .map(|o| o.output_text())
            .unwrap_or_default();

        // Step 5: check for reproduce.sh.
        let repro_script_exists = sandbox
            .exec("test -f /submission/reproduce.sh", true)
            .await
            .map(|o| o.success())
            .unwrap_or(false);

        if !repro_script_exists {
            return ReproductionMetadata {
                is_valid_git_repo,
                git_log,
                repro_script_exists: false,
                files_before_reproduce,
                files_after_reproduce: String::new(),
                timedout: false,
                repro_log: String::new(),
                retried_results: Vec::new(),
                repro_execution_time: None,
                git_status_after_reproduce: None,
                executed_submission: Some(format!("snapshot taken at {}", Utc::now())),
            };
        }

        // Step 6: execute under a hard timeout.
        let first_attempt = self.execute_reproduce(sandbox, config.timeout_secs).await;

        // Step 7: salvage retry.
        let mut retried_results = Vec::new();
        let mut authoritative_attempt = first_attempt.clone();
        if config.salvage_enabled() && !first_attempt.timedout && first_attempt.repro_execution_time < config.retry_threshold_secs {
            let _ = sandbox
                .exec(
                    "mkdir -p /submission/output && export $(cat /submission/agent.env 2>/dev/null | xargs -d '\\n' || true)",
                    true,
                )
                .await;
            let retry_attempt = self.execute_reproduce(sandbox, config.timeout_secs).await;
            retried_results.push(first_attempt.clone());
            retried_results.push(retry_attempt.clone());
            authoritative_attempt = retry_attempt;
        }

        // Step 8: snapshot after + git status diff.
        let files_after_reproduce = self.list_files(sandbox).await;
        let git_status_after_reproduce = sandbox
            .exec("cd /submission && git status --porcelain", true)
            .await
            .map(|o| o.output_text())
            .ok();

        ReproductionMetadata {
            is_valid_git_repo,
            git_log,
            repro_script_exists: true,
            files_before_reproduce,
            files_after_reproduce,
            timedout: authoritative_attempt.timedout,
            repro_log: authoritative_attempt.repro_log.clone(),
            retried_results,
            repro_execution_time: Some(authoritative_attempt.repro_execution_time),
            git_status_after_reproduce,
            executed_submission: Some(format!("executed at {}", Utc::now())),
        }
    }

    async fn list_files(&self, sandbox: &ReleasableSandbox) -> String {
        sandbox
            .exec("find /submission -type f | sort", true)
            .await
            .map(|o| o.output_text())
            .unwrap_or_default()
    }

    async fn execute_reproduce(&self, sandbox: &ReleasableSandbox, timeout_secs: u64) -> ReproScriptRunOutcome {
        let started = Instant::now();
        let cmd = format!(
            "cd /submission && timeout {timeout_secs}s bash reproduce.sh; echo EXIT_CODE=$?",
            timeout_secs = timeout_secs
        );
        let result = sandbox.exec(&cmd, false).await;
        let elapsed = started.elapsed();

        match result {
            Ok(output) => {
                let text = output.output_text();
                let timedout = elapsed >= Duration::from_secs(timeout_secs);
                ReproScriptRunOutcome {
                    repro_execution_time: elapsed.as_secs_f64(),
                    timedout,
                    repro_log: text,
                }
            }
            Err(err) => ReproScriptRunOutcome {
                repro_execution_time: elapsed.as_secs_f64(),
                timedout: false,
                repro_log: format!("reproduce.sh execution failed: {err}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paperbench_sandbox::LocalProcessRuntime;

    #[tokio::test]
    async fn missing_reproduce_script_is_recorded() {
        let runtime = LocalProcessRuntime::new();
        let runner = ReproductionRunner::new(&runtime);
        let config = ReproductionConfig::default();

        // an empty tar.gz extracts to nothing, so reproduce.sh is absent
        let empty_tar_gz = build_empty_tar_gz();
        let metadata = runner.run(&empty_tar_gz, &config).await.unwrap();
        assert!(!metadata.repro_script_exists);
        assert!(!metadata.timedout);
    }

    #[test]
    fn skip_mode_yields_empty_metadata() {
        let metadata = ReproductionRunner::<LocalProcessRuntime>::skip();
        assert!(!metadata.repro_script_exists);
        assert!(metadata.repro_execution_time.is_none());
    }

    /// §8 scenario 4: a `reproduce.sh` that finishes well under the
    /// `retry_threshold` (600s, against a `timeout` of 3600s) must
    /// trigger the salvage retry, record both attempts in
    /// `retried_results`, and report the *retry's* time as the
    /// authoritative `repro_execution_time`, while keeping the first
    /// attempt's log.
    #[tokio::test]
    async fn fast_reproduce_triggers_salvage_retry_and_reports_second_attempts_time() {
        let runtime = LocalProcessRuntime::new();
        let runner = ReproductionRunner::new(&runtime);
        let config = ReproductionConfig {
            timeout_secs: 3600,
            retry_threshold_secs: 600.0,
            ..Default::default()
        };
        assert!(config.salvage_enabled());

        let submission_tar_gz = build_reproduce_script_tar_gz("echo first-attempt-log");
        let metadata = runner.run(&submission_tar_gz, &config).await.unwrap();

        assert!(metadata.repro_script_exists);
        assert_eq!(metadata.retried_results.len(), 2);
        assert!(metadata.retried_results[0].repro_log.contains("first-attempt-log"));
        assert_eq!(
            metadata.repro_execution_time,
            Some(metadata.retried_results[1].repro_execution_time)
        );
        assert_ne!(
            metadata.repro_execution_time,
            Some(metadata.retried_results[0].repro_execution_time)
        );
    }

    /// Builds a tar.gz shaped like a genuine submission archive (§3,
    /// §6): `reproduce.sh` nested under a top-level `submission/`
    /// prefix, the same as `paperbench-snapshot`'s `take_snapshot` tar
    /// command produces.
    fn build_reproduce_script_tar_gz(script_body: &str) -> Vec<u8> {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let script = format!("#!/bin/sh\n{script_body}\n");
        let mut header = tar::Header::new_gnu();
        header.set_path("submission/reproduce.sh").unwrap();
        header.set_size(script.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();

        let mut builder = tar::Builder::new(Vec::new());
        builder.append(&header, script.as_bytes()).unwrap();
        let tar_bytes = builder.into_inner().unwrap();

        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&tar_bytes).unwrap();
        gz.finish().unwrap()
    }

    fn build_empty_tar_gz() -> Vec<u8> {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let builder = tar::Builder::new(Vec::new());
        let tar_bytes = builder.into_inner().unwrap();
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&tar_bytes).unwrap();
        gz.finish().unwrap()
    }
}
