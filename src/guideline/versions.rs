//! Versioned prompt artifacts.
//!
//! Every rebuild is saved as `{kind}_v{MAJOR.MINOR.PATCH}.json` next to the
//! current `active_{kind}_agent_prompts.json`, so any prior version can be
//! restored. Rollback is itself a rebuild: the restored prompt is saved
//! under a fresh version number, keeping the chain linear.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::agent::AgentKind;
use crate::error::{Error, Result};

use super::generator::AgentPrompt;

/// Directory-backed store of active and versioned prompts.
pub struct VersionStore {
    dir: PathBuf,
}

impl VersionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn version_path(&self, kind: AgentKind, version: &str) -> PathBuf {
        self.dir.join(format!("{}_v{}.json", kind, version))
    }

    fn active_path(&self, kind: AgentKind) -> PathBuf {
        self.dir.join(format!("active_{}_agent_prompts.json", kind))
    }

    /// Versions on disk for a kind, ascending.
    pub fn versions(&self, kind: AgentKind) -> Result<Vec<(u32, u32, u32)>> {
        let pattern = self.dir.join(format!("{}_v*.json", kind));
        let entries = glob::glob(&pattern.to_string_lossy())
            .map_err(|e| Error::storage(format!("bad version glob: {}", e)))?;

        let mut versions = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| Error::storage(format!("unreadable version entry: {}", e)))?;
            let stem = match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => stem,
                None => continue,
            };
            let version_str = match stem.split("_v").nth(1) {
                Some(v) => v,
                None => continue,
            };
            match parse_version(version_str) {
                Some(version) => versions.push(version),
                None => warn!("Skipping malformed version file {}", path.display()),
            }
        }
        versions.sort();
        Ok(versions)
    }

    /// Latest version string, if any version exists.
    pub fn latest_version(&self, kind: AgentKind) -> Result<Option<String>> {
        Ok(self.versions(kind)?.last().map(|v| format_version(*v)))
    }

    /// Next version: patch bump over the latest, or 1.0.0.
    pub fn next_version(&self, kind: AgentKind) -> Result<String> {
        Ok(match self.versions(kind)?.last() {
            Some((major, minor, patch)) => format_version((*major, *minor, patch + 1)),
            None => "1.0.0".to_string(),
        })
    }

    /// Save a prompt under an explicit version.
    pub fn save_version(&self, kind: AgentKind, version: &str, prompt: &AgentPrompt) -> Result<PathBuf> {
        let path = self.version_path(kind, version);
        fs::write(&path, serde_json::to_string_pretty(prompt)?)
            .map_err(|e| Error::storage(format!("failed to write '{}': {}", path.display(), e)))?;
        info!("Saved prompt version {} for {}", version, kind);
        Ok(path)
    }

    /// Load one version, or the latest when `version` is `None`.
    pub fn load_version(&self, kind: AgentKind, version: Option<&str>) -> Result<Option<AgentPrompt>> {
        let version = match version {
            Some(v) => v.to_string(),
            None => match self.latest_version(kind)? {
                Some(v) => v,
                None => return Ok(None),
            },
        };
        let path = self.version_path(kind, &version);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)
            .map_err(|e| Error::storage(format!("failed to read '{}': {}", path.display(), e)))?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    /// Overwrite the active prompt for a kind.
    pub fn save_active(&self, kind: AgentKind, prompt: &AgentPrompt) -> Result<()> {
        let path = self.active_path(kind);
        fs::write(&path, serde_json::to_string_pretty(prompt)?)
            .map_err(|e| Error::storage(format!("failed to write '{}': {}", path.display(), e)))
    }

    /// Load the active prompt for a kind, if present.
    pub fn load_active(&self, kind: AgentKind) -> Result<Option<AgentPrompt>> {
        let path = self.active_path(kind);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)
            .map_err(|e| Error::storage(format!("failed to read '{}': {}", path.display(), e)))?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    /// Restore a prior version as active and save it under a fresh version
    /// number, so the version chain stays linear.
    pub fn rollback_to_version(&self, kind: AgentKind, version: &str) -> Result<AgentPrompt> {
        let prompt = self
            .load_version(kind, Some(version))?
            .ok_or_else(|| Error::storage(format!("version {} not found for {}", version, kind)))?;
        let new_version = self.next_version(kind)?;
        self.save_version(kind, &new_version, &prompt)?;
        self.save_active(kind, &prompt)?;
        info!("Rolled back {} to version {} (saved as v{})", kind, version, new_version);
        Ok(prompt)
    }

    /// Remove every version file, keeping active prompts.
    pub fn clear_versions(&self) -> Result<()> {
        for kind in AgentKind::ALL {
            let pattern = self.dir.join(format!("{}_v*.json", kind));
            let entries = glob::glob(&pattern.to_string_lossy())
                .map_err(|e| Error::storage(format!("bad version glob: {}", e)))?;
            for entry in entries {
                let path = entry.map_err(|e| Error::storage(format!("unreadable version entry: {}", e)))?;
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

fn parse_version(s: &str) -> Option<(u32, u32, u32)> {
    let mut parts = s.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

fn format_version((major, minor, patch): (u32, u32, u32)) -> String {
    format!("{}.{}.{}", major, minor, patch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_version_chain_starts_at_1_0_0() {
        let dir = tempdir().unwrap();
        let store = VersionStore::new(dir.path()).unwrap();

        assert_eq!(store.next_version(AgentKind::Diagnosis).unwrap(), "1.0.0");
        store
            .save_version(AgentKind::Diagnosis, "1.0.0", &AgentPrompt::new("v0"))
            .unwrap();
        assert_eq!(store.next_version(AgentKind::Diagnosis).unwrap(), "1.0.1");
        assert_eq!(
            store.latest_version(AgentKind::Diagnosis).unwrap().as_deref(),
            Some("1.0.0")
        );
    }

    #[test]
    fn test_versions_are_per_kind() {
        let dir = tempdir().unwrap();
        let store = VersionStore::new(dir.path()).unwrap();
        store
            .save_version(AgentKind::Diagnosis, "1.0.0", &AgentPrompt::new("d"))
            .unwrap();

        assert_eq!(store.next_version(AgentKind::Localization).unwrap(), "1.0.0");
    }

    #[test]
    fn test_rollback_saves_new_version() {
        let dir = tempdir().unwrap();
        let store = VersionStore::new(dir.path()).unwrap();

        store
            .save_version(AgentKind::Mitigation, "1.0.0", &AgentPrompt::new("good"))
            .unwrap();
        store
            .save_version(AgentKind::Mitigation, "1.0.1", &AgentPrompt::new("bad"))
            .unwrap();

        let restored = store.rollback_to_version(AgentKind::Mitigation, "1.0.0").unwrap();
        assert_eq!(restored.system, "good");
        assert_eq!(
            store.latest_version(AgentKind::Mitigation).unwrap().as_deref(),
            Some("1.0.2")
        );
        assert_eq!(
            store.load_active(AgentKind::Mitigation).unwrap().unwrap().system,
            "good"
        );
        assert_eq!(
            store
                .load_version(AgentKind::Mitigation, Some("1.0.2"))
                .unwrap()
                .unwrap()
                .system,
            "good"
        );
    }

    #[test]
    fn test_active_prompt_roundtrip() {
        let dir = tempdir().unwrap();
        let store = VersionStore::new(dir.path()).unwrap();
        assert!(store.load_active(AgentKind::Rollback).unwrap().is_none());

        let prompt = AgentPrompt::new("rollback base");
        store.save_active(AgentKind::Rollback, &prompt).unwrap();
        assert_eq!(store.load_active(AgentKind::Rollback).unwrap().unwrap(), prompt);
    }

    #[test]
    fn test_clear_versions_keeps_active() {
        let dir = tempdir().unwrap();
        let store = VersionStore::new(dir.path()).unwrap();
        store
            .save_version(AgentKind::Diagnosis, "1.0.0", &AgentPrompt::new("v"))
            .unwrap();
        store.save_active(AgentKind::Diagnosis, &AgentPrompt::new("a")).unwrap();

        store.clear_versions().unwrap();
        assert!(store.latest_version(AgentKind::Diagnosis).unwrap().is_none());
        assert!(store.load_active(AgentKind::Diagnosis).unwrap().is_some());
    }
}
