/*!
 * Atomic JSON persistence
 *
 * Checkpoints, tracking registries, and the health file are all replaced
 * whole: serialize to a sibling `.tmp`, then rename over the live file.
 * When a live file exists it is shuffled to `.bak` first and the backup is
 * removed once the new file is in place, so a crash at any point leaves a
 * readable copy behind.
 */

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

/// Atomically replace `path` with the JSON serialization of `value`.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let tmp = sibling_with_suffix(path, ".tmp");
    let bak = sibling_with_suffix(path, ".bak");

    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(&tmp, json)?;

    if path.exists() {
        // Renaming over an existing file is not atomic everywhere; keep the
        // old content reachable until the new file has landed.
        let _ = std::fs::remove_file(&bak);
        std::fs::rename(path, &bak)?;
    }
    std::fs::rename(&tmp, path)?;
    let _ = std::fs::remove_file(&bak);

    Ok(())
}

/// Load a JSON file, returning `None` when it does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&content)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        value: u64,
    }

    #[test]
    fn test_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sample.json");
        let sample = Sample {
            name: "one".to_string(),
            value: 42,
        };

        write_json_atomic(&path, &sample).unwrap();
        let loaded: Sample = read_json(&path).unwrap().unwrap();
        assert_eq!(loaded, sample);
    }

    #[test]
    fn test_missing_file_reads_none() {
        let dir = tempdir().unwrap();
        let loaded: Option<Sample> = read_json(&dir.path().join("absent.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_overwrite_leaves_no_droppings() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sample.json");

        for value in 0..3u64 {
            write_json_atomic(
                &path,
                &Sample {
                    name: "x".to_string(),
                    value,
                },
            )
            .unwrap();
        }

        let loaded: Sample = read_json(&path).unwrap().unwrap();
        assert_eq!(loaded.value, 2);
        assert!(!dir.path().join("sample.json.tmp").exists());
        assert!(!dir.path().join("sample.json.bak").exists());
    }

    #[test]
    fn test_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("deep").join("state").join("s.json");
        write_json_atomic(
            &path,
            &Sample {
                name: "n".to_string(),
                value: 1,
            },
        )
        .unwrap();
        assert!(path.exists());
    }
}
