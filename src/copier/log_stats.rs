/*!
 * Final statistics parsing from the copier log
 *
 * The log file, not captured stdout, is the authoritative record: the
 * copier flushes it before exiting. The summary block is three rows of six
 * numeric columns (Total, Copied, Skipped, Mismatch, FAILED, Extras) for
 * Dirs, Files, and Bytes. Number formats vary by locale and the Bytes row
 * may scale values with k/m/g/t suffixes (1024-based). When the summary is
 * not present yet (live tailing), parsing falls back to the file-list
 * progress lines.
 */

use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::copier::progress::ProgressBuffer;
use crate::error::Result;

static SUMMARY_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*([A-Za-z]+)\s*:\s*(.+)$").unwrap());

static ERROR_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"ERROR\s+(\d+)\s+\(0x([0-9A-Fa-f]+)\)\s+(.*)$").unwrap()
});

/// One deduplicated per-file copier error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyFileError {
    pub code: u32,
    pub path: String,
    /// The action phrase plus the copier's follow-up description, if any
    pub message: String,
}

/// Parsed summary of one chunk log
#[derive(Debug, Clone, Default)]
pub struct LogStats {
    /// True when the final summary block was found
    pub parse_success: bool,
    pub dirs_total: u64,
    pub dirs_copied: u64,
    pub files_total: u64,
    pub files_copied: u64,
    pub files_failed: u64,
    pub bytes_total: u64,
    pub bytes_copied: u64,
    pub errors: Vec<CopyFileError>,
}

/// Parse a complete or in-progress copier log.
pub fn parse_log(text: &str) -> LogStats {
    let lines: Vec<&str> = text.lines().collect();

    let mut stats = LogStats {
        errors: extract_errors(&lines),
        ..Default::default()
    };

    // The last three summary-shaped rows are Dirs, Files, Bytes.
    let summary_rows: Vec<[f64; 6]> = lines
        .iter()
        .filter_map(|line| parse_summary_row(line))
        .collect();

    if summary_rows.len() >= 3 {
        let bytes = summary_rows[summary_rows.len() - 1];
        let files = summary_rows[summary_rows.len() - 2];
        let dirs = summary_rows[summary_rows.len() - 3];

        stats.parse_success = true;
        stats.dirs_total = dirs[0] as u64;
        stats.dirs_copied = dirs[1] as u64;
        stats.files_total = files[0] as u64;
        stats.files_copied = files[1] as u64;
        stats.files_failed = files[4] as u64;
        stats.bytes_total = bytes[0] as u64;
        stats.bytes_copied = bytes[1] as u64;
        return stats;
    }

    // No summary yet: derive partial progress from the file list.
    let progress = ProgressBuffer::new();
    for line in &lines {
        progress.ingest_line(line);
    }
    stats.files_copied = progress.files_copied();
    stats.bytes_copied = progress.bytes_copied();
    stats
}

/// Read and parse a log that another process may still be writing.
///
/// `File::open` requests shared read/write access on Windows, so the
/// copier keeps appending while we look.
pub fn read_log_lenient(path: &Path) -> Result<LogStats> {
    let text = std::fs::read_to_string(path)?;
    Ok(parse_log(&text))
}

/// Parse one candidate summary row into its six numeric columns.
fn parse_summary_row(line: &str) -> Option<[f64; 6]> {
    let caps = SUMMARY_LABEL.captures(line)?;
    let tokens: Vec<&str> = caps[2].split_whitespace().collect();

    let mut values = Vec::with_capacity(6);
    let mut i = 0;
    while i < tokens.len() {
        let number = parse_locale_number(tokens[i])?;
        // An isolated single-letter token after a number is its unit.
        let multiplier = if i + 1 < tokens.len() {
            match unit_multiplier(tokens[i + 1]) {
                Some(m) => {
                    i += 1;
                    m
                }
                None => 1.0,
            }
        } else {
            1.0
        };
        values.push(number * multiplier);
        i += 1;
    }

    if values.len() == 6 {
        Some([values[0], values[1], values[2], values[3], values[4], values[5]])
    } else {
        None
    }
}

fn unit_multiplier(token: &str) -> Option<f64> {
    if token.len() != 1 {
        return None;
    }
    match token.chars().next()?.to_ascii_lowercase() {
        'k' => Some(1024.0),
        'm' => Some(1024.0 * 1024.0),
        'g' => Some(1024.0 * 1024.0 * 1024.0),
        't' => Some(1024.0 * 1024.0 * 1024.0 * 1024.0),
        _ => None,
    }
}

/// Parse a number that may use US thousands-separators (`1,234,567`),
/// European format (`1.234,56`), or plain decimals (`134.0`).
fn parse_locale_number(token: &str) -> Option<f64> {
    if token.is_empty() || !token.chars().all(|c| c.is_ascii_digit() || c == '.' || c == ',') {
        return None;
    }
    if !token.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    let dots = token.matches('.').count();
    let commas = token.matches(',').count();

    let normalized = if dots > 0 && commas > 0 {
        // Both present: the later separator is the decimal point.
        let last_dot = token.rfind('.').unwrap_or(0);
        let last_comma = token.rfind(',').unwrap_or(0);
        if last_comma > last_dot {
            token.replace('.', "").replace(',', ".")
        } else {
            token.replace(',', "")
        }
    } else if commas > 0 {
        normalize_single_separator(token, ',')
    } else if dots > 0 {
        normalize_single_separator(token, '.')
    } else {
        token.to_string()
    };

    normalized.parse::<f64>().ok()
}

/// One separator kind present: a single occurrence with one or two digits
/// after it reads as a decimal point; otherwise it groups thousands.
fn normalize_single_separator(token: &str, sep: char) -> String {
    let count = token.matches(sep).count();
    let after = token.rsplit(sep).next().map(str::len).unwrap_or(0);
    if count == 1 && after <= 2 {
        token.replace(sep, ".")
    } else {
        token.replace(sep, "")
    }
}

/// Phrases that precede the path in copier error lines.
const PATH_MARKERS: [&str; 2] = ["File ", "Directory "];

fn extract_errors(lines: &[&str]) -> Vec<CopyFileError> {
    let mut seen_paths = HashSet::new();
    let mut errors = Vec::new();

    for (i, line) in lines.iter().enumerate() {
        let Some(caps) = ERROR_LINE.captures(line) else {
            continue;
        };
        let code = caps[1].parse::<u32>().unwrap_or(0);
        let rest = caps[3].trim();

        let path = PATH_MARKERS
            .iter()
            .filter_map(|marker| rest.rfind(marker).map(|at| &rest[at + marker.len()..]))
            .next_back()
            .unwrap_or(rest)
            .trim()
            .to_string();

        // The copier re-emits the same ERROR line per retry wave; surface
        // each file once.
        if !seen_paths.insert(path.to_lowercase()) {
            continue;
        }

        // The descriptive message usually follows on the next line.
        let description = lines
            .get(i + 1)
            .map(|next| next.trim())
            .filter(|next| !next.is_empty() && !ERROR_LINE.is_match(next))
            .unwrap_or("");

        let message = if description.is_empty() {
            rest.to_string()
        } else {
            format!("{} - {}", rest, description)
        };

        errors.push(CopyFileError {
            code,
            path,
            message,
        });
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    const US_LOG: &str = "\
   ROBOCOPY     ::     Robust File Copy for Windows
------------------------------------------------------------------------------
    New File              1000    D:\\data\\a.bin
    New File              2000    D:\\data\\b.bin
------------------------------------------------------------------------------

               Total    Copied   Skipped  Mismatch    FAILED    Extras
    Dirs :        10         5         5         0         0         0
   Files :       100        90        10         0         0         2
   Bytes :   1,234,567   1,100,000   134,567         0         0         0
";

    const EU_LOG: &str = "\
------------------------------------------------------------------------------

               Total    Copied   Skipped  Mismatch    FAILED    Extras
    Dirs :        10         5         5         0         0         0
   Files :     1.000       900       100         0         3         0
   Bytes :   1.234,56 m   1.100,25 m   134,0 k         0         0         0
";

    #[test]
    fn test_us_format_summary() {
        let stats = parse_log(US_LOG);
        assert!(stats.parse_success);
        assert_eq!(stats.dirs_total, 10);
        assert_eq!(stats.dirs_copied, 5);
        assert_eq!(stats.files_total, 100);
        assert_eq!(stats.files_copied, 90);
        assert_eq!(stats.bytes_total, 1_234_567);
        assert_eq!(stats.bytes_copied, 1_100_000);
    }

    #[test]
    fn test_eu_format_with_unit_suffixes() {
        let stats = parse_log(EU_LOG);
        assert!(stats.parse_success);
        assert_eq!(stats.files_total, 1000);
        assert_eq!(stats.files_copied, 900);
        assert_eq!(stats.files_failed, 3);
        // 1234.56 MiB and 1100.25 MiB, 1024-based.
        assert_eq!(stats.bytes_total, (1234.56 * 1024.0 * 1024.0) as u64);
        assert_eq!(stats.bytes_copied, (1100.25 * 1024.0 * 1024.0) as u64);
    }

    #[test]
    fn test_unit_suffix_case_insensitive() {
        let line = "   Bytes :   1 K   2 M   3 G   4 T   0   0";
        let row = parse_summary_row(line).unwrap();
        assert_eq!(row[0], 1024.0);
        assert_eq!(row[1], 2.0 * 1024.0 * 1024.0);
        assert_eq!(row[2], 3.0 * 1024.0 * 1024.0 * 1024.0);
        assert_eq!(row[3], 4.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0);
    }

    #[test]
    fn test_empty_log_fails_softly() {
        let stats = parse_log("");
        assert!(!stats.parse_success);
        assert_eq!(stats.bytes_copied, 0);
        assert_eq!(stats.files_copied, 0);
        assert!(stats.errors.is_empty());
    }

    #[test]
    fn test_partial_log_falls_back_to_file_list() {
        let partial = "\
    New File              1000    D:\\data\\a.bin
    New File              2000    D:\\data\\b.bin
  50%
";
        let stats = parse_log(partial);
        assert!(!stats.parse_success);
        // a.bin finished when b.bin started; b.bin is half done.
        assert_eq!(stats.files_copied, 1);
        assert_eq!(stats.bytes_copied, 2000);
    }

    #[test]
    fn test_error_extraction_and_dedup() {
        let log = "\
2026/06/01 03:04:05 ERROR 32 (0x00000020) Copying File D:\\data\\locked.db
The process cannot access the file because it is being used by another process.
2026/06/01 03:04:10 ERROR 32 (0x00000020) Copying File D:\\data\\locked.db
The process cannot access the file because it is being used by another process.
2026/06/01 03:04:15 ERROR 5 (0x00000005) Accessing Source Directory D:\\data\\secret\\
Access is denied.
";
        let stats = parse_log(log);
        assert_eq!(stats.errors.len(), 2);

        assert_eq!(stats.errors[0].code, 32);
        assert_eq!(stats.errors[0].path, "D:\\data\\locked.db");
        assert!(stats.errors[0].message.contains("being used by another process"));

        assert_eq!(stats.errors[1].code, 5);
        assert_eq!(stats.errors[1].path, "D:\\data\\secret\\");
    }

    #[test]
    fn test_locale_number_rules() {
        assert_eq!(parse_locale_number("1234"), Some(1234.0));
        assert_eq!(parse_locale_number("1,234,567"), Some(1_234_567.0));
        assert_eq!(parse_locale_number("1.234,56"), Some(1234.56));
        assert_eq!(parse_locale_number("1,234.56"), Some(1234.56));
        assert_eq!(parse_locale_number("134.0"), Some(134.0));
        assert_eq!(parse_locale_number("134,0"), Some(134.0));
        assert_eq!(parse_locale_number("1.234"), Some(1234.0));
        assert_eq!(parse_locale_number("1.234.567"), Some(1_234_567.0));
        assert_eq!(parse_locale_number("x12"), None);
        assert_eq!(parse_locale_number(""), None);
    }

    #[test]
    fn test_summary_rows_must_have_six_columns() {
        assert!(parse_summary_row("   Dirs :   1   2   3   4   5").is_none());
        assert!(parse_summary_row("   Speed :   123456 Bytes/sec.").is_none());
        assert!(parse_summary_row("   Dirs :   1   2   3   4   5   6").is_some());
    }
}
