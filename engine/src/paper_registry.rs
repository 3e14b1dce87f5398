//! Local filesystem paper registry. The core (§1) treats the paper
//! corpus as an external input; this binary fixes one concrete layout
//! so `run-eval`/`run-judge` have something to read rubrics and
//! instructions from:
//!
//! ```text
//! <papers-dir>/splits/<split-name>.json   -> ["paper_a", "paper_b", ...]
//! <papers-dir>/<paper-id>/rubric.json      -> TaskNode JSON (§6)
//! <papers-dir>/<paper-id>/instructions.md  -> agent instructions
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use paperbench_scheduler::{PaperProvider, PaperSplit};
use paperbench_types::{ConfigError, TaskNodeJson};

pub struct FileSystemPaperProvider {
    papers_dir: PathBuf,
}

impl FileSystemPaperProvider {
    pub fn new(papers_dir: impl Into<PathBuf>) -> Self {
        Self { papers_dir: papers_dir.into() }
    }

    pub fn load_split(&self, name: &str) -> Result<PaperSplit> {
        let path = self.papers_dir.join("splits").join(format!("{name}.json"));
        let bytes = std::fs::read(&path).with_context(|| format!("reading paper split at {}", path.display()))?;
        let paper_ids: Vec<String> = serde_json::from_slice(&bytes).with_context(|| format!("parsing paper split at {}", path.display()))?;
        Ok(PaperSplit { name: name.to_string(), paper_ids })
    }

    fn rubric_path(&self, paper_id: &str) -> PathBuf {
        self.papers_dir.join(paper_id).join("rubric.json")
    }

    fn instructions_path(&self, paper_id: &str) -> PathBuf {
        self.papers_dir.join(paper_id).join("instructions.md")
    }

    pub fn load_rubric(&self, paper_id: &str) -> Result<TaskNodeJson> {
        read_rubric(paper_id, &self.rubric_path(paper_id)).map_err(anyhow::Error::from)
    }
}

/// §7 `ConfigError`: a missing rubric file is `MissingPaper`, one that
/// exists but fails to parse is `MalformedRubric` — these must fail
/// fast before scheduling, never fall back to a placeholder rubric.
fn read_rubric(paper_id: &str, path: &Path) -> Result<TaskNodeJson, ConfigError> {
    let bytes = std::fs::read(path).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            ConfigError::MissingPaper(format!("{paper_id}: no rubric.json at {}", path.display()))
        } else {
            ConfigError::MalformedRubric(format!("{paper_id}: failed to read {}: {err}", path.display()))
        }
    })?;
    serde_json::from_slice(&bytes)
        .map_err(|err| ConfigError::MalformedRubric(format!("{paper_id}: invalid rubric JSON at {}: {err}", path.display())))
}

impl PaperProvider for FileSystemPaperProvider {
    fn rubric(&self, paper_id: &str) -> Result<TaskNodeJson, ConfigError> {
        read_rubric(paper_id, &self.rubric_path(paper_id))
    }

    fn instructions(&self, paper_id: &str) -> Result<String, ConfigError> {
        std::fs::read_to_string(self.instructions_path(paper_id)).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                ConfigError::MissingPaper(format!("{paper_id}: no instructions.md at {}", self.instructions_path(paper_id).display()))
            } else {
                ConfigError::MissingPaper(format!("{paper_id}: failed to read instructions.md: {err}"))
            }
        })
    }
}
