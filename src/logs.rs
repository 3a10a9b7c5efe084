use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::cli::LogKind;

/// Path of the captured `kind` stream for `service` under `log_dir`.
pub fn log_path(log_dir: &Path, service: &str, kind: LogKind) -> PathBuf {
    log_dir.join(format!("{service}.{kind}.log"))
}

/// Reads the last `lines` lines of a service's captured output.
///
/// # Returns
/// * `Ok(None)` when the service has not written that stream yet.
pub fn tail_logs(
    log_dir: &Path,
    service: &str,
    kind: LogKind,
    lines: usize,
) -> io::Result<Option<Vec<String>>> {
    let path = log_path(log_dir, service, kind);
    if !path.exists() {
        return Ok(None);
    }

    let reader = BufReader::new(File::open(path)?);
    let all_lines: Vec<String> = reader.lines().map_while(Result::ok).collect();
    let start = all_lines.len().saturating_sub(lines);
    Ok(Some(all_lines[start..].to_vec()))
}
