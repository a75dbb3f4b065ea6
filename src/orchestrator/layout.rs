//! Per-run directory layout.
//!
//! Every round gets its own `run_<timestamp>/` tree so rounds are isolated:
//! traces, prompts, configs and points written by one round are only ever
//! read by the next through explicit carry-over.

use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// A single round's result directory.
#[derive(Debug, Clone)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    /// Create a fresh `run_<YYYYmmdd_HHMMSS>/` tree under `results_root`.
    pub fn create(results_root: &Path) -> Result<Self> {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let mut root = results_root.join(format!("run_{}", stamp));
        // Two rounds within the same second get a numeric suffix.
        let mut counter = 1;
        while root.exists() {
            root = results_root.join(format!("run_{}_{}", stamp, counter));
            counter += 1;
        }

        let layout = Self { root };
        for dir in [
            layout.traces_dir(),
            layout.prompts_dir(),
            layout.configs_dir(),
            layout.points_dir(),
        ] {
            fs::create_dir_all(&dir)?;
        }
        Ok(layout)
    }

    /// Open an existing run directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(Error::storage(format!("run directory '{}' not found", root.display())));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn traces_dir(&self) -> PathBuf {
        self.root.join("traces")
    }

    pub fn prompts_dir(&self) -> PathBuf {
        self.root.join("prompts")
    }

    pub fn configs_dir(&self) -> PathBuf {
        self.root.join("configs")
    }

    pub fn points_dir(&self) -> PathBuf {
        self.root.join("points")
    }

    pub fn learning_results_path(&self) -> PathBuf {
        self.root.join("learning_results.json")
    }

    pub fn round_info_path(&self) -> PathBuf {
        self.root.join("round_info.json")
    }
}

/// Copy every `*.json` file from `src` into `dst`.
pub fn copy_json_files(src: &Path, dst: &Path) -> Result<usize> {
    if !src.is_dir() {
        return Ok(0);
    }
    fs::create_dir_all(dst)?;
    let pattern = src.join("*.json");
    let entries = glob::glob(&pattern.to_string_lossy())
        .map_err(|e| Error::storage(format!("bad copy glob: {}", e)))?;

    let mut copied = 0;
    for entry in entries {
        let path = entry.map_err(|e| Error::storage(format!("unreadable entry: {}", e)))?;
        if let Some(name) = path.file_name() {
            fs::copy(&path, dst.join(name))?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_builds_subdirectories() {
        let dir = tempdir().unwrap();
        let layout = RunLayout::create(dir.path()).unwrap();

        assert!(layout.traces_dir().is_dir());
        assert!(layout.prompts_dir().is_dir());
        assert!(layout.configs_dir().is_dir());
        assert!(layout.points_dir().is_dir());
    }

    #[test]
    fn test_same_second_runs_get_distinct_roots() {
        let dir = tempdir().unwrap();
        let first = RunLayout::create(dir.path()).unwrap();
        let second = RunLayout::create(dir.path()).unwrap();
        assert_ne!(first.root(), second.root());
    }

    #[test]
    fn test_copy_json_files() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        fs::write(src.path().join("a.json"), "{}").unwrap();
        fs::write(src.path().join("b.txt"), "skip").unwrap();

        let copied = copy_json_files(src.path(), dst.path()).unwrap();
        assert_eq!(copied, 1);
        assert!(dst.path().join("a.json").exists());
        assert!(!dst.path().join("b.txt").exists());
    }

    #[test]
    fn test_copy_from_missing_dir_is_noop() {
        let dst = tempdir().unwrap();
        let copied = copy_json_files(Path::new("/nonexistent/nowhere"), dst.path()).unwrap();
        assert_eq!(copied, 0);
    }
}
