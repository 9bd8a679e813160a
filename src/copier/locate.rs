/*!
 * Copier binary resolution
 *
 * Resolution order: explicit override, the platform system directory, then
 * PATH. The first hit is cached for the life of the process.
 */

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing::debug;

use crate::error::{RobocurseError, Result};

#[cfg(windows)]
const COPIER_EXE: &str = "robocopy.exe";
#[cfg(not(windows))]
const COPIER_EXE: &str = "robocopy";

static RESOLVED: OnceLock<Option<PathBuf>> = OnceLock::new();

/// Locate the copier binary, caching the first successful resolution.
pub fn locate_copier(override_path: Option<&Path>) -> Result<PathBuf> {
    // An explicit override is honored every call and never cached, so a
    // config change is not masked by an earlier resolution.
    if let Some(path) = override_path {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(RobocurseError::CopierNotFound);
    }

    RESOLVED
        .get_or_init(|| {
            let found = system_dir_candidate().filter(|p| p.is_file()).or_else(search_path);
            if let Some(ref path) = found {
                debug!(copier = %path.display(), "resolved copier binary");
            }
            found
        })
        .clone()
        .ok_or(RobocurseError::CopierNotFound)
}

fn system_dir_candidate() -> Option<PathBuf> {
    #[cfg(windows)]
    {
        std::env::var_os("SystemRoot").map(|root| PathBuf::from(root).join("System32").join(COPIER_EXE))
    }
    #[cfg(not(windows))]
    {
        None
    }
}

fn search_path() -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(COPIER_EXE);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}
