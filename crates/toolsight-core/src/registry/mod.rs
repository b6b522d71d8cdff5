//! Model Registry
//!
//! Filesystem-backed catalog of model artifacts: one weights file per
//! artifact plus a `meta.json` sidecar, grouped into `fine_tuned/` and
//! `backups/`. An `active` pointer file names the serving version; promotion
//! writes the artifact fully, syncs, then swaps the pointer with an atomic
//! rename so readers never observe a half-written handle.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::{Error, Result};

// ============================================================================
// TYPES
// ============================================================================

/// Where an artifact came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactOrigin {
    /// The pretrained checkpoint
    Base,
    /// Produced by a fine-tuning session
    FineTuned,
    /// Snapshot taken before training or restore
    Backup,
}

impl ArtifactOrigin {
    fn subdir(&self) -> &'static str {
        match self {
            ArtifactOrigin::Base | ArtifactOrigin::FineTuned => "fine_tuned",
            ArtifactOrigin::Backup => "backups",
        }
    }
}

impl std::fmt::Display for ArtifactOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ArtifactOrigin::Base => "base",
            ArtifactOrigin::FineTuned => "fine_tuned",
            ArtifactOrigin::Backup => "backup",
        };
        write!(f, "{name}")
    }
}

/// A registered model artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub version: String,
    pub origin: ArtifactOrigin,
    /// Weights file on disk
    pub path: PathBuf,
    pub size_bytes: u64,
    pub sha256: String,
    pub created_at: DateTime<Utc>,
}

/// The `meta.json` sidecar format
#[derive(Debug, Serialize, Deserialize)]
struct ArtifactMeta {
    version: String,
    origin: ArtifactOrigin,
    created_at: DateTime<Utc>,
    size_bytes: u64,
    sha256: String,
}

// ============================================================================
// REGISTRY
// ============================================================================

/// On-disk registry of model artifacts
pub struct ModelRegistry {
    root: PathBuf,
}

impl ModelRegistry {
    /// Open a registry, creating its directory layout if needed, and verify
    /// that an existing active pointer resolves to a readable artifact
    ///
    /// A pointer naming a missing artifact is a startup-fatal condition.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("fine_tuned"))?;
        fs::create_dir_all(root.join("backups"))?;
        let registry = Self { root };

        if let Some(version) = registry.active_version()? {
            registry.find(&version).map_err(|_| {
                Error::Internal(format!(
                    "active pointer names missing artifact {version}; registry at {} is corrupt",
                    registry.root.display()
                ))
            })?;
        }
        Ok(registry)
    }

    fn pointer_path(&self) -> PathBuf {
        self.root.join("active")
    }

    fn artifact_dir(&self, origin: ArtifactOrigin) -> PathBuf {
        self.root.join(origin.subdir())
    }

    fn weights_path(&self, version: &str, origin: ArtifactOrigin) -> PathBuf {
        self.artifact_dir(origin).join(format!("{version}.safetensors"))
    }

    fn meta_path(&self, version: &str, origin: ArtifactOrigin) -> PathBuf {
        self.artifact_dir(origin).join(format!("{version}.meta.json"))
    }

    /// Timestamp-derived version string for a new artifact
    pub fn next_version(prefix: &str) -> String {
        format!("{prefix}_{}", Utc::now().format("%Y%m%d_%H%M%S"))
    }

    // ========================================================================
    // REGISTRATION
    // ========================================================================

    /// Copy a weights file into the registry under a new version
    pub fn register(
        &self,
        weights: &Path,
        version: &str,
        origin: ArtifactOrigin,
    ) -> Result<ModelArtifact> {
        if self.find(version).is_ok() {
            return Err(Error::Internal(format!(
                "artifact version {version} already registered"
            )));
        }

        let dest = self.weights_path(version, origin);
        fs::copy(weights, &dest)
            .map_err(|e| Error::Internal(format!("artifact copy to {}: {e}", dest.display())))?;

        let size_bytes = fs::metadata(&dest)?.len();
        let sha256 = file_sha256(&dest)?;
        let created_at = Utc::now();

        let meta = ArtifactMeta {
            version: version.to_string(),
            origin,
            created_at,
            size_bytes,
            sha256: sha256.clone(),
        };
        let meta_path = self.meta_path(version, origin);
        fs::write(&meta_path, serde_json::to_vec_pretty(&meta)?)?;

        // Sync the weights file so a promotion that follows cannot point at
        // unflushed data.
        fs::File::open(&dest)?.sync_all()?;

        info!(version, origin = %origin, size_bytes, "model artifact registered");
        Ok(ModelArtifact {
            version: version.to_string(),
            origin,
            path: dest,
            size_bytes,
            sha256,
            created_at,
        })
    }

    // ========================================================================
    // LOOKUP
    // ========================================================================

    /// Locate an artifact by version, in any origin directory
    pub fn find(&self, version: &str) -> Result<ModelArtifact> {
        for origin in [
            ArtifactOrigin::FineTuned,
            ArtifactOrigin::Backup,
            ArtifactOrigin::Base,
        ] {
            let meta_path = self.meta_path(version, origin);
            if meta_path.exists() {
                return self.load_meta(&meta_path);
            }
        }
        Err(Error::NotFound(format!("model artifact {version}")))
    }

    /// List artifacts, optionally filtered by origin, newest first
    pub fn list(&self, origin: Option<ArtifactOrigin>) -> Result<Vec<ModelArtifact>> {
        let mut artifacts = Vec::new();
        let dirs: &[&str] = &["fine_tuned", "backups"];
        for dir in dirs {
            let dir = self.root.join(dir);
            if !dir.exists() {
                continue;
            }
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(".meta.json"))
                {
                    let artifact = self.load_meta(&path)?;
                    if origin.is_none() || origin == Some(artifact.origin) {
                        artifacts.push(artifact);
                    }
                }
            }
        }
        artifacts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.version.cmp(&a.version)));
        Ok(artifacts)
    }

    fn load_meta(&self, meta_path: &Path) -> Result<ModelArtifact> {
        let raw = fs::read_to_string(meta_path)?;
        let meta: ArtifactMeta = serde_json::from_str(&raw)
            .map_err(|e| Error::Internal(format!("{}: {e}", meta_path.display())))?;
        let path = self.weights_path(&meta.version, meta.origin);
        if !path.exists() {
            return Err(Error::NotFound(format!(
                "weights missing for {}",
                meta.version
            )));
        }
        Ok(ModelArtifact {
            version: meta.version,
            origin: meta.origin,
            path,
            size_bytes: meta.size_bytes,
            sha256: meta.sha256,
            created_at: meta.created_at,
        })
    }

    // ========================================================================
    // ACTIVE POINTER
    // ========================================================================

    /// The version the pointer currently names, if a pointer exists
    pub fn active_version(&self) -> Result<Option<String>> {
        let pointer = self.pointer_path();
        if !pointer.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&pointer)?;
        let version = raw.trim().to_string();
        if version.is_empty() {
            return Ok(None);
        }
        Ok(Some(version))
    }

    /// Resolve the active artifact; `None` means no promotion has happened
    /// yet and the pretrained base serves queries
    pub fn active(&self) -> Result<Option<ModelArtifact>> {
        match self.active_version()? {
            Some(version) => self.find(&version).map(Some),
            None => Ok(None),
        }
    }

    /// Atomically point `active` at a registered version
    pub fn promote(&self, version: &str) -> Result<ModelArtifact> {
        let artifact = self.find(version)?;

        // Write-then-rename: readers either see the old pointer or the new
        // one, never a torn write.
        let tmp = self.root.join("active.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(version.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, self.pointer_path())?;

        info!(version, "model promoted to active");
        Ok(artifact)
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Move an artifact into the backups directory, retagging its origin
    pub fn archive(&self, version: &str) -> Result<ModelArtifact> {
        let artifact = self.find(version)?;
        if artifact.origin == ArtifactOrigin::Backup {
            return Ok(artifact);
        }
        if self.active_version()?.as_deref() == Some(version) {
            return Err(Error::Internal(format!(
                "refusing to archive active model {version}"
            )));
        }

        let new_weights = self.weights_path(version, ArtifactOrigin::Backup);
        fs::rename(&artifact.path, &new_weights)?;
        let meta = ArtifactMeta {
            version: artifact.version.clone(),
            origin: ArtifactOrigin::Backup,
            created_at: artifact.created_at,
            size_bytes: artifact.size_bytes,
            sha256: artifact.sha256.clone(),
        };
        fs::write(
            self.meta_path(version, ArtifactOrigin::Backup),
            serde_json::to_vec_pretty(&meta)?,
        )?;
        fs::remove_file(self.meta_path(version, artifact.origin))?;

        self.find(version)
    }

    /// Delete an artifact and its sidecar; the active artifact is protected
    pub fn delete(&self, version: &str) -> Result<()> {
        if self.active_version()?.as_deref() == Some(version) {
            return Err(Error::Internal(format!(
                "refusing to delete active model {version}"
            )));
        }
        let artifact = self.find(version)?;
        fs::remove_file(&artifact.path)?;
        fs::remove_file(self.meta_path(version, artifact.origin))?;
        info!(version, "model artifact deleted");
        Ok(())
    }

    /// Drop all but the newest `keep` backups, returning the removed versions
    pub fn cleanup_backups(&self, keep: usize) -> Result<Vec<String>> {
        let backups = self.list(Some(ArtifactOrigin::Backup))?;
        let mut removed = Vec::new();
        for artifact in backups.into_iter().skip(keep) {
            if self.active_version()?.as_deref() == Some(artifact.version.as_str()) {
                continue;
            }
            self.delete(&artifact.version)?;
            removed.push(artifact.version);
        }
        Ok(removed)
    }
}

fn file_sha256(path: &Path) -> Result<String> {
    let bytes = fs::read(path)?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

// ============================================================================
// TESTS
// ============================================================================
