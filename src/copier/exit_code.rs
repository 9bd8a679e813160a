/*!
 * Copier exit-code interpretation
 *
 * Robocopy exit codes are a bitmask: bit 0 files copied, bit 1 extras seen
 * in the destination, bit 2 mismatches, bit 3 per-file copy errors, bit 4
 * fatal. Severity is derived in fixed priority order; whether a chunk is
 * retried is a separate question answered here as well.
 */

use crate::config::MismatchSeverity;

pub const EXIT_FILES_COPIED: u32 = 1 << 0;
pub const EXIT_EXTRAS: u32 = 1 << 1;
pub const EXIT_MISMATCHES: u32 = 1 << 2;
pub const EXIT_COPY_ERRORS: u32 = 1 << 3;
pub const EXIT_FATAL: u32 = 1 << 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Success,
    Warning,
    Error,
    Fatal,
}

/// Outcome of interpreting one exit code
#[derive(Debug, Clone)]
pub struct ExitAnalysis {
    pub exit_code: u32,
    pub severity: Severity,
    pub should_retry: bool,
    pub message: String,
}

impl ExitAnalysis {
    pub fn is_failure(&self) -> bool {
        matches!(self.severity, Severity::Error | Severity::Fatal)
    }
}

/// Interpret a robocopy exit code under the profile's mismatch policy.
pub fn interpret_exit_code(exit_code: u32, mismatch: MismatchSeverity) -> ExitAnalysis {
    let code = exit_code & 0x1F;

    let fatal = code & EXIT_FATAL != 0;
    let copy_errors = code & EXIT_COPY_ERRORS != 0;
    let mismatches = code & EXIT_MISMATCHES != 0;
    let extras = code & EXIT_EXTRAS != 0;
    let copied = code & EXIT_FILES_COPIED != 0;

    // A pure fatal is usually permanent; fatal alongside per-file copy
    // errors tends to clear on a second pass. Mismatches retry only when
    // the profile treats them as errors.
    let should_retry =
        (fatal && copy_errors) || (mismatches && mismatch == MismatchSeverity::Error);

    let (severity, message) = if fatal {
        (
            Severity::Fatal,
            if copy_errors {
                "fatal error with per-file copy errors".to_string()
            } else {
                "fatal error (no files copied)".to_string()
            },
        )
    } else if copy_errors {
        (
            Severity::Warning,
            "some files could not be copied after per-file retries".to_string(),
        )
    } else if mismatches {
        match mismatch {
            MismatchSeverity::Error => (
                Severity::Error,
                "mismatched files or directories detected".to_string(),
            ),
            MismatchSeverity::Warning => (
                Severity::Warning,
                "mismatched files or directories detected".to_string(),
            ),
            MismatchSeverity::Ignore => {
                (Severity::Success, "mismatches ignored by policy".to_string())
            }
        }
    } else if extras {
        (
            Severity::Success,
            "extra files or directories present in destination".to_string(),
        )
    } else if copied {
        (Severity::Success, "files copied".to_string())
    } else {
        (Severity::Success, "no changes needed".to_string())
    };

    ExitAnalysis {
        exit_code,
        severity,
        should_retry,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_exits_are_success() {
        for code in [0u32, 1, 2, 3] {
            let analysis = interpret_exit_code(code, MismatchSeverity::Warning);
            assert_eq!(analysis.severity, Severity::Success, "code {}", code);
            assert!(!analysis.should_retry);
        }
    }

    #[test]
    fn test_copy_errors_alone_are_warning_without_retry() {
        let analysis = interpret_exit_code(8, MismatchSeverity::Warning);
        assert_eq!(analysis.severity, Severity::Warning);
        assert!(!analysis.should_retry);

        let analysis = interpret_exit_code(9, MismatchSeverity::Warning);
        assert_eq!(analysis.severity, Severity::Warning);
        assert!(!analysis.should_retry);
    }

    #[test]
    fn test_pure_fatal_is_not_retried() {
        let analysis = interpret_exit_code(16, MismatchSeverity::Warning);
        assert_eq!(analysis.severity, Severity::Fatal);
        assert!(!analysis.should_retry);
    }

    #[test]
    fn test_fatal_with_copy_errors_retries() {
        let analysis = interpret_exit_code(24, MismatchSeverity::Warning);
        assert_eq!(analysis.severity, Severity::Fatal);
        assert!(analysis.should_retry);
    }

    #[test]
    fn test_mismatch_policy() {
        let warn = interpret_exit_code(4, MismatchSeverity::Warning);
        assert_eq!(warn.severity, Severity::Warning);
        assert!(!warn.should_retry);

        let error = interpret_exit_code(4, MismatchSeverity::Error);
        assert_eq!(error.severity, Severity::Error);
        assert!(error.should_retry);

        let ignore = interpret_exit_code(4, MismatchSeverity::Ignore);
        assert_eq!(ignore.severity, Severity::Success);
        assert!(!ignore.should_retry);
    }

    #[test]
    fn test_priority_order_over_full_mask() {
        for code in 0u32..32 {
            let analysis = interpret_exit_code(code, MismatchSeverity::Warning);
            let expected = if code & EXIT_FATAL != 0 {
                Severity::Fatal
            } else if code & EXIT_COPY_ERRORS != 0 {
                Severity::Warning
            } else if code & EXIT_MISMATCHES != 0 {
                Severity::Warning
            } else {
                Severity::Success
            };
            assert_eq!(analysis.severity, expected, "code {}", code);
        }
    }

    #[test]
    fn test_retry_truth_table() {
        for code in 0u32..32 {
            for mismatch in [
                MismatchSeverity::Warning,
                MismatchSeverity::Error,
                MismatchSeverity::Ignore,
            ] {
                let analysis = interpret_exit_code(code, mismatch);
                let expected = (code & EXIT_FATAL != 0 && code & EXIT_COPY_ERRORS != 0)
                    || (code & EXIT_MISMATCHES != 0 && mismatch == MismatchSeverity::Error);
                assert_eq!(
                    analysis.should_retry, expected,
                    "code {} mismatch {:?}",
                    code, mismatch
                );
            }
        }
    }

    #[test]
    fn test_high_bits_masked() {
        let analysis = interpret_exit_code(0x80000001, MismatchSeverity::Warning);
        assert_eq!(analysis.severity, Severity::Success);
    }
}
