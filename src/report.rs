/*!
 * Failed-files summary
 *
 * Aggregates the per-file errors from every chunk log into one
 * `FailedFiles_<session-id>.txt` for operators. Each chunk with errors
 * contributes a header followed by one line per affected file; the copier
 * re-emits errors per retry wave, but the parser has already deduplicated
 * by path.
 */

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::copier::log_stats::CopyFileError;
use crate::error::Result;

/// Human descriptions for the common Win32 error codes the copier hits.
fn describe_code(code: u32) -> &'static str {
    match code {
        2 => "file not found",
        3 => "path not found",
        5 => "access denied",
        19 => "media write protected",
        32 => "sharing violation",
        33 => "lock violation",
        53 => "network path not found",
        59 => "unexpected network error",
        64 => "network name no longer available",
        112 => "not enough disk space",
        121 => "semaphore timeout",
        1314 => "required privilege not held",
        _ => "unrecognized error",
    }
}

/// 1024-based human formatting, matching the copier's own unit convention.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

/// Append-only writer for one session's failed-files summary
pub struct FailedFilesReport {
    path: PathBuf,
}

impl FailedFilesReport {
    pub fn new(state_dir: &Path, session_id: &str) -> Self {
        Self {
            path: state_dir.join(format!("FailedFiles_{}.txt", session_id)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one chunk's errors. Chunks without errors leave no trace.
    pub fn append_chunk_errors(
        &self,
        chunk_log_name: &str,
        errors: &[CopyFileError],
    ) -> Result<()> {
        if errors.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;

        writeln!(file, "=== {} ===", chunk_log_name)?;
        let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S");
        for error in errors {
            writeln!(
                file,
                "[{}] ERROR {} (0x{:08X}) {} [{}]",
                timestamp,
                error.code,
                error.code,
                error.message,
                describe_code(error.code)
            )?;
        }
        writeln!(file)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn error(code: u32, path: &str) -> CopyFileError {
        CopyFileError {
            code,
            path: path.to_string(),
            message: format!("Copying File {}", path),
        }
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KiB");
        assert_eq!(format_bytes(1536), "1.50 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MiB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GiB");
        assert_eq!(format_bytes(2 * 1024 * 1024 * 1024 * 1024), "2.00 TiB");
    }

    #[test]
    fn test_no_errors_leaves_no_file() {
        let dir = tempdir().unwrap();
        let report = FailedFilesReport::new(dir.path(), "sess");
        report.append_chunk_errors("sess_Chunk_1.log", &[]).unwrap();
        assert!(!report.path().exists());
    }

    #[test]
    fn test_header_and_error_lines() {
        let dir = tempdir().unwrap();
        let report = FailedFilesReport::new(dir.path(), "sess");

        report
            .append_chunk_errors(
                "sess_Chunk_1.log",
                &[error(32, r"D:\data\locked.db"), error(5, r"D:\data\secret")],
            )
            .unwrap();

        let text = std::fs::read_to_string(report.path()).unwrap();
        assert!(text.contains("=== sess_Chunk_1.log ==="));
        assert!(text.contains("ERROR 32 (0x00000020)"));
        assert!(text.contains("[sharing violation]"));
        assert!(text.contains("ERROR 5 (0x00000005)"));
        assert!(text.contains("[access denied]"));
    }

    #[test]
    fn test_appends_across_chunks() {
        let dir = tempdir().unwrap();
        let report = FailedFilesReport::new(dir.path(), "sess");

        report
            .append_chunk_errors("sess_Chunk_1.log", &[error(32, "a")])
            .unwrap();
        report
            .append_chunk_errors("sess_Chunk_2.log", &[error(112, "b")])
            .unwrap();

        let text = std::fs::read_to_string(report.path()).unwrap();
        assert!(text.contains("Chunk_1"));
        assert!(text.contains("Chunk_2"));
        assert!(text.contains("[not enough disk space]"));
    }
}
