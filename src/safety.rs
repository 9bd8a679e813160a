/*!
 * Safety validation for copier arguments
 *
 * Everything that reaches the copier command line passes through here.
 * Paths are validated and refused outright when hostile; exclude patterns
 * and per-chunk arguments are filtered (dropped with a warning) so a bad
 * pattern never blocks a whole profile.
 */

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use crate::config::CopyOptions;
use crate::error::{RobocurseError, Result};

static ENV_EXPANSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%[^%]+%").unwrap());

/// Whitelisted per-chunk argument shapes. Anything else is dropped.
static CHUNK_ARG_WHITELIST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(/LEV:\d+|/S|/E|/MAXAGE:\d+|/MINAGE:\d+|/MAXLAD:\d+|/MINLAD:\d+)$")
        .unwrap()
});

/// Switches the orchestrator owns; user copies of these are stripped.
static MANAGED_SWITCH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^/(MT|R|W|LOG|MIR|E|TEE|NP|BYTES)(:.*)?$").unwrap());

/// What kind of exclude list is being sanitized (for log context).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExcludeKind {
    Files,
    Directories,
}

impl ExcludeKind {
    fn label(self) -> &'static str {
        match self {
            ExcludeKind::Files => "exclude-file",
            ExcludeKind::Directories => "exclude-dir",
        }
    }
}

/// Returns true when a value is safe to place on the copier command line.
///
/// Rejects command separators, redirection, substitution syntax, environment
/// expansion, parent traversal, control characters, and leading dashes.
pub fn validate_arg(value: &str) -> bool {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return false;
    }
    if trimmed.chars().any(|c| (c as u32) < 0x20) {
        return false;
    }
    if trimmed.contains([';', '&', '|', '<', '>', '`']) {
        return false;
    }
    if trimmed.contains("$(") || trimmed.contains("${") {
        return false;
    }
    if ENV_EXPANSION.is_match(trimmed) {
        return false;
    }
    if has_parent_traversal(trimmed) {
        return false;
    }
    if trimmed.starts_with('-') {
        return false;
    }
    true
}

fn has_parent_traversal(value: &str) -> bool {
    value.contains("../") || value.contains("..\\")
}

/// Validate a path, returning it unchanged or refusing with `UnsafeInput`.
pub fn sanitize_path(path: &Path) -> Result<PathBuf> {
    let text = path.to_string_lossy();
    if validate_arg(&text) {
        Ok(path.to_path_buf())
    } else {
        Err(RobocurseError::UnsafeInput(format!(
            "path {:?} contains forbidden characters",
            text
        )))
    }
}

/// Filter an exclude-pattern list down to its safe entries.
///
/// Unsafe entries are logged and dropped; this never fails.
pub fn sanitize_exclude_patterns(patterns: &[String], kind: ExcludeKind) -> Vec<String> {
    patterns
        .iter()
        .filter(|pattern| {
            if validate_arg(pattern) {
                true
            } else {
                warn!(pattern = %pattern, kind = kind.label(), "dropping unsafe exclude pattern");
                false
            }
        })
        .cloned()
        .collect()
}

/// Whitelist-filter per-chunk extra arguments.
pub fn sanitize_chunk_args(args: &[String]) -> Vec<String> {
    args.iter()
        .filter(|arg| {
            if CHUNK_ARG_WHITELIST.is_match(arg) {
                true
            } else {
                warn!(arg = %arg, "dropping non-whitelisted chunk argument");
                false
            }
        })
        .cloned()
        .collect()
}

/// Returns true when the switch is one the orchestrator manages itself.
pub fn is_managed_switch(switch: &str) -> bool {
    MANAGED_SWITCH.is_match(switch)
}

/// Lint a profile's option bundle. Returns warnings; never blocks.
pub fn validate_options(options: &CopyOptions) -> Vec<String> {
    let mut warnings = Vec::new();

    let upper: Vec<String> = options
        .switches
        .iter()
        .map(|s| s.trim().to_ascii_uppercase())
        .collect();

    let has = |name: &str| upper.iter().any(|s| s == name || s.starts_with(&format!("{}:", name)));

    if has("/PURGE") && !has("/MIR") {
        warnings.push(
            "/PURGE without /MIR deletes destination extras without mirroring".to_string(),
        );
    }
    if has("/MOV") || has("/MOVE") {
        warnings.push("/MOV and /MOVE delete source files after copying".to_string());
    }
    if has("/XX") && (has("/MIR") || has("/PURGE")) {
        warnings.push("/XX suppresses the deletions /MIR or /PURGE would perform".to_string());
    }

    for switch in &upper {
        if is_managed_switch(switch) {
            warnings.push(format!(
                "{} collides with an orchestrator-managed switch and will be stripped",
                switch
            ));
        }
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_paths_accepted() {
        assert!(validate_arg(r"D:\Data\Projects"));
        assert!(validate_arg(r"\\server\share\folder"));
        assert!(validate_arg("relative/unix/style"));
        assert!(validate_arg("file with spaces.txt"));
        assert!(validate_arg("100% complete.txt")); // lone percent, not %..%
    }

    #[test]
    fn test_separators_and_redirection_rejected() {
        assert!(!validate_arg("a;b"));
        assert!(!validate_arg("a&b"));
        assert!(!validate_arg("a|b"));
        assert!(!validate_arg("a<b"));
        assert!(!validate_arg("a>b"));
        assert!(!validate_arg("a`b`c"));
    }

    #[test]
    fn test_substitution_and_expansion_rejected() {
        assert!(!validate_arg("$(whoami)"));
        assert!(!validate_arg("${HOME}/x"));
        assert!(!validate_arg(r"%TEMP%\x"));
    }

    #[test]
    fn test_traversal_and_leading_dash_rejected() {
        assert!(!validate_arg(r"..\up\and\over"));
        assert!(!validate_arg("../etc/passwd"));
        assert!(!validate_arg("-trailing"));
        // A bare ".." path component without a separator is not traversal.
        assert!(validate_arg("file..name.txt"));
    }

    #[test]
    fn test_empty_and_control_chars_rejected() {
        assert!(!validate_arg(""));
        assert!(!validate_arg("   "));
        assert!(!validate_arg("a\u{0007}b"));
        assert!(!validate_arg("a\nb"));
    }

    #[test]
    fn test_sanitize_path() {
        assert!(sanitize_path(Path::new(r"D:\Data")).is_ok());
        let err = sanitize_path(Path::new(r"D:\Data & del C:")).unwrap_err();
        assert!(matches!(err, RobocurseError::UnsafeInput(_)));
    }

    #[test]
    fn test_exclude_filtering_drops_bad_entries() {
        let patterns = vec![
            "*.tmp".to_string(),
            "node_modules".to_string(),
            "$(evil)".to_string(),
            "a|b".to_string(),
        ];
        let safe = sanitize_exclude_patterns(&patterns, ExcludeKind::Files);
        assert_eq!(safe, vec!["*.tmp".to_string(), "node_modules".to_string()]);
    }

    #[test]
    fn test_chunk_arg_whitelist() {
        let args = vec![
            "/LEV:1".to_string(),
            "/S".to_string(),
            "/E".to_string(),
            "/MAXAGE:30".to_string(),
            "/MINLAD:7".to_string(),
            "/PURGE".to_string(),
            "/LEV:abc".to_string(),
            "/MIR".to_string(),
        ];
        let safe = sanitize_chunk_args(&args);
        assert_eq!(
            safe,
            vec![
                "/LEV:1".to_string(),
                "/S".to_string(),
                "/E".to_string(),
                "/MAXAGE:30".to_string(),
                "/MINLAD:7".to_string(),
            ]
        );
    }

    #[test]
    fn test_chunk_arg_whitelist_case_insensitive() {
        let safe = sanitize_chunk_args(&vec!["/lev:2".to_string(), "/maxage:10".to_string()]);
        assert_eq!(safe.len(), 2);
    }

    #[test]
    fn test_managed_switch_detection() {
        assert!(is_managed_switch("/MT"));
        assert!(is_managed_switch("/MT:32"));
        assert!(is_managed_switch("/log:out.txt"));
        assert!(is_managed_switch("/LOG:C:\\x.log"));
        assert!(is_managed_switch("/R:5"));
        assert!(is_managed_switch("/BYTES"));
        assert!(!is_managed_switch("/MAXAGE:3"));
        assert!(!is_managed_switch("/XF"));
    }

    #[test]
    fn test_option_lint_purge_without_mir() {
        let options = CopyOptions {
            switches: vec!["/PURGE".to_string()],
            ..Default::default()
        };
        let warnings = validate_options(&options);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("/PURGE"));
    }

    #[test]
    fn test_option_lint_move_and_collisions() {
        let options = CopyOptions {
            switches: vec![
                "/MOVE".to_string(),
                "/MT:64".to_string(),
                "/TEE".to_string(),
            ],
            ..Default::default()
        };
        let warnings = validate_options(&options);
        assert_eq!(warnings.len(), 3);
    }

    #[test]
    fn test_option_lint_clean_bundle() {
        let options = CopyOptions {
            switches: vec!["/MAXAGE:30".to_string(), "/XO".to_string()],
            ..Default::default()
        };
        assert!(validate_options(&options).is_empty());
    }
}
