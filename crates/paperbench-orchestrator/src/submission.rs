//! Builds a `SubmissionView` (the judge's read-only file excerpt,
//! §4.E) by extracting a gzip-tar submission archive in-process. This
//! is the `grade_locally=true` path `JudgeConfig` already distinguishes
//! (see DESIGN.md): the grading-sandbox staging §4.E describes for the
//! remote case reduces to the same exec/extract steps the Reproduction
//! Runner already performs, so it is not duplicated here.

use std::io::Read;

use flate2::read::GzDecoder;
use paperbench_judge::SubmissionView;

const MAX_FILE_BYTES: usize = 64 * 1024;
const MAX_TOTAL_BYTES: usize = 2 * 1024 * 1024;

pub fn submission_view_from_tar_gz(tar_gz: &[u8]) -> std::io::Result<SubmissionView> {
    let decoder = GzDecoder::new(tar_gz);
    let mut archive = tar::Archive::new(decoder);

    let mut files = std::collections::HashMap::new();
    let mut total = 0usize;
    for entry in archive.entries()? {
        let mut entry = entry?;
        if total >= MAX_TOTAL_BYTES {
            break;
        }
        let path = entry.path()?.to_string_lossy().into_owned();
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let size = entry.header().size().unwrap_or(0) as usize;
        if size > MAX_FILE_BYTES {
            continue;
        }
        let mut content = String::new();
        if entry.read_to_string(&mut content).is_err() {
            continue; // binary or non-UTF8 file, skip
        }
        total += content.len();
        files.insert(path, content);
    }
    Ok(SubmissionView::new(files))
}
