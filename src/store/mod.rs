//! Content-addressed artifact store with per-artifact manifests.
//!
//! Artifact ids are the hex sha-256 of the canonical content bytes, so a
//! repeated put of identical bytes is idempotent: the refcount goes up and
//! the existing id comes back. Versions are producer-chosen semver, validated
//! monotone per artifact. Rollback moves a logical pointer; it never removes
//! a version.
//!
//! On-disk layout per artifact:
//! `artifacts/<id>/manifest` and `artifacts/<id>/versions/<semver>.bytes`.

use crate::collector::content_hash;
use crate::errors::StoreError;
use anyhow::Context;
use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Artifact lifecycle status. Transitions run strictly forward, with the one
/// sanctioned loop DRAFT↔IN_REVIEW.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    #[default]
    Draft,
    InReview,
    Approved,
    InUse,
    Deprecated,
    Archived,
}

impl ArtifactStatus {
    fn rank(&self) -> u8 {
        match self {
            Self::Draft => 0,
            Self::InReview => 1,
            Self::Approved => 2,
            Self::InUse => 3,
            Self::Deprecated => 4,
            Self::Archived => 5,
        }
    }

    /// Forward-only, except the review loop.
    pub fn can_transition(from: Self, to: Self) -> bool {
        if from == to {
            return true;
        }
        if from == Self::InReview && to == Self::Draft {
            return true;
        }
        to.rank() > from.rank()
    }
}

/// Producer-supplied metadata for a put.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub kind: String,
    /// Semver chosen by the producer; validated monotone per artifact id.
    pub version: String,
    pub created_by: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl ArtifactMeta {
    pub fn new(kind: &str, version: &str, created_by: &str) -> Self {
        Self {
            kind: kind.to_string(),
            version: version.to_string(),
            created_by: created_by.to_string(),
            dependencies: Vec::new(),
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

/// One stored version of an artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactVersion {
    pub version: String,
    pub path: PathBuf,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// Per-artifact manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub id: String,
    pub kind: String,
    pub status: ArtifactStatus,
    pub versions: Vec<ArtifactVersion>,
    pub dependencies: Vec<String>,
    pub created_by: String,
    pub hash: String,
    pub refcount: u64,
    pub created_at: DateTime<Utc>,
}

impl ArtifactManifest {
    fn latest_version(&self) -> Option<&ArtifactVersion> {
        self.versions.last()
    }
}

/// A logical pointer like `login-component@current`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPointer {
    pub artifact_id: String,
    pub version: String,
}

#[derive(Default)]
struct StoreIndex {
    manifests: HashMap<String, ArtifactManifest>,
    pointers: BTreeMap<String, ArtifactPointer>,
}

/// The artifact store. Concurrent puts are mediated by hash lookup then
/// refcount increment under the store lock.
pub struct ArtifactStore {
    root: PathBuf,
    index: Mutex<StoreIndex>,
}

impl ArtifactStore {
    /// Open (or create) a store rooted at `root`, loading any manifests
    /// already on disk.
    pub fn open(root: impl AsRef<Path>) -> anyhow::Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join("artifacts"))
            .context("failed to create artifact root")?;

        let mut index = StoreIndex::default();
        let artifacts_dir = root.join("artifacts");
        for entry in std::fs::read_dir(&artifacts_dir)?.flatten() {
            let manifest_path = entry.path().join("manifest");
            if !manifest_path.is_file() {
                continue;
            }
            let content = std::fs::read_to_string(&manifest_path)
                .with_context(|| format!("failed to read {}", manifest_path.display()))?;
            let manifest: ArtifactManifest = serde_json::from_str(&content)
                .with_context(|| format!("failed to parse {}", manifest_path.display()))?;
            index.manifests.insert(manifest.id.clone(), manifest);
        }

        let pointers_path = root.join("pointers.json");
        if pointers_path.is_file() {
            let content = std::fs::read_to_string(&pointers_path)?;
            index.pointers = serde_json::from_str(&content).unwrap_or_default();
        }

        Ok(Self {
            root,
            index: Mutex::new(index),
        })
    }

    fn lock(&self) -> MutexGuard<'_, StoreIndex> {
        match self.index.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn artifact_dir(&self, id: &str) -> PathBuf {
        self.root.join("artifacts").join(id)
    }

    fn persist_manifest(&self, manifest: &ArtifactManifest) -> Result<(), StoreError> {
        let dir = self.artifact_dir(&manifest.id);
        std::fs::create_dir_all(dir.join("versions"))
            .context("failed to create artifact version dir")?;
        let json = serde_json::to_string_pretty(manifest)
            .context("failed to serialize artifact manifest")?;
        std::fs::write(dir.join("manifest"), json).context("failed to write artifact manifest")?;
        Ok(())
    }

    fn persist_pointers(&self, pointers: &BTreeMap<String, ArtifactPointer>) -> Result<(), StoreError> {
        let json =
            serde_json::to_string_pretty(pointers).context("failed to serialize pointers")?;
        std::fs::write(self.root.join("pointers.json"), json)
            .context("failed to write pointers")?;
        Ok(())
    }

    fn parse_version(version: &str) -> Result<Version, StoreError> {
        Version::parse(version).map_err(|err| StoreError::InvalidVersion {
            version: version.to_string(),
            reason: err.to_string(),
        })
    }

    /// Store bytes under their content hash.
    ///
    /// Existing id: refcount goes up; a strictly greater version appends a
    /// new version entry; an equal version is the idempotent case; a lesser
    /// version is rejected.
    pub fn put(&self, bytes: &[u8], meta: ArtifactMeta) -> Result<String, StoreError> {
        let id = content_hash(bytes);
        let version = Self::parse_version(&meta.version)?;
        let mut index = self.lock();

        if let Some(manifest) = index.manifests.get_mut(&id) {
            manifest.refcount += 1;
            let latest = manifest
                .latest_version()
                .map(|v| Self::parse_version(&v.version))
                .transpose()?;
            match latest {
                Some(latest) if version < latest => {
                    manifest.refcount -= 1;
                    return Err(StoreError::NonMonotoneVersion {
                        id,
                        version: meta.version,
                        existing: latest.to_string(),
                    });
                }
                Some(latest) if version == latest => {
                    let manifest = manifest.clone();
                    self.persist_manifest(&manifest)?;
                    tracing::debug!(artifact_id = %id, refcount = manifest.refcount, "artifact deduplicated");
                    return Ok(id);
                }
                _ => {
                    let path = self.write_version_bytes(&id, &meta.version, bytes)?;
                    manifest.versions.push(ArtifactVersion {
                        version: meta.version.clone(),
                        path,
                        size: bytes.len() as u64,
                        created_at: Utc::now(),
                    });
                    let manifest = manifest.clone();
                    self.persist_manifest(&manifest)?;
                    return Ok(id);
                }
            }
        }

        let path = self.write_version_bytes(&id, &meta.version, bytes)?;
        let manifest = ArtifactManifest {
            id: id.clone(),
            kind: meta.kind,
            status: ArtifactStatus::Draft,
            versions: vec![ArtifactVersion {
                version: meta.version,
                path,
                size: bytes.len() as u64,
                created_at: Utc::now(),
            }],
            dependencies: meta.dependencies,
            created_by: meta.created_by,
            hash: id.clone(),
            refcount: 1,
            created_at: Utc::now(),
        };
        self.persist_manifest(&manifest)?;
        index.manifests.insert(id.clone(), manifest);
        tracing::debug!(artifact_id = %id, "artifact stored");
        Ok(id)
    }

    fn write_version_bytes(
        &self,
        id: &str,
        version: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, StoreError> {
        let dir = self.artifact_dir(id).join("versions");
        std::fs::create_dir_all(&dir).context("failed to create version dir")?;
        let path = dir.join(format!("{version}.bytes"));
        std::fs::write(&path, bytes).context("failed to write artifact bytes")?;
        Ok(path)
    }

    /// Read artifact bytes; latest version when none is named.
    pub fn get(&self, id: &str, version: Option<&str>) -> Result<Vec<u8>, StoreError> {
        let path = {
            let index = self.lock();
            let manifest = index
                .manifests
                .get(id)
                .ok_or_else(|| StoreError::ArtifactNotFound(id.to_string()))?;
            let entry = match version {
                Some(version) => manifest
                    .versions
                    .iter()
                    .find(|v| v.version == version)
                    .ok_or_else(|| StoreError::VersionNotFound {
                        id: id.to_string(),
                        version: version.to_string(),
                    })?,
                None => manifest
                    .latest_version()
                    .ok_or_else(|| StoreError::ArtifactNotFound(id.to_string()))?,
            };
            entry.path.clone()
        };
        std::fs::read(&path)
            .with_context(|| format!("failed to read {}", path.display()))
            .map_err(StoreError::from)
    }

    pub fn manifest(&self, id: &str) -> Result<ArtifactManifest, StoreError> {
        self.lock()
            .manifests
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::ArtifactNotFound(id.to_string()))
    }

    /// Version history, oldest first.
    pub fn history(&self, id: &str) -> Result<Vec<ArtifactVersion>, StoreError> {
        Ok(self.manifest(id)?.versions)
    }

    /// Artifacts that list `id` as a dependency (reverse-index scan).
    pub fn dependents(&self, id: &str) -> Vec<String> {
        let index = self.lock();
        let mut out: Vec<String> = index
            .manifests
            .values()
            .filter(|m| m.dependencies.iter().any(|d| d == id))
            .map(|m| m.id.clone())
            .collect();
        out.sort();
        out
    }

    /// Move an artifact's status. Forward-only except DRAFT↔IN_REVIEW.
    pub fn set_status(&self, id: &str, status: ArtifactStatus) -> Result<(), StoreError> {
        let mut index = self.lock();
        let manifest = index
            .manifests
            .get_mut(id)
            .ok_or_else(|| StoreError::ArtifactNotFound(id.to_string()))?;
        if !ArtifactStatus::can_transition(manifest.status, status) {
            return Err(StoreError::InvalidStatusTransition {
                id: id.to_string(),
                from: manifest.status,
                to: status,
            });
        }
        manifest.status = status;
        let manifest = manifest.clone();
        self.persist_manifest(&manifest)
    }

    /// Bind a logical name to an artifact version.
    pub fn set_pointer(&self, name: &str, id: &str, version: &str) -> Result<(), StoreError> {
        let mut index = self.lock();
        let manifest = index
            .manifests
            .get(id)
            .ok_or_else(|| StoreError::ArtifactNotFound(id.to_string()))?;
        if !manifest.versions.iter().any(|v| v.version == version) {
            return Err(StoreError::VersionNotFound {
                id: id.to_string(),
                version: version.to_string(),
            });
        }
        index.pointers.insert(
            name.to_string(),
            ArtifactPointer {
                artifact_id: id.to_string(),
                version: version.to_string(),
            },
        );
        let pointers = index.pointers.clone();
        self.persist_pointers(&pointers)
    }

    pub fn pointer(&self, name: &str) -> Result<ArtifactPointer, StoreError> {
        self.lock()
            .pointers
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::PointerNotFound(name.to_string()))
    }

    /// Roll a pointer back to an earlier version of the same artifact. The
    /// version stays on disk; only the pointer moves.
    pub fn rollback(&self, name: &str, version: &str) -> Result<(), StoreError> {
        let current = self.pointer(name)?;
        self.set_pointer(name, &current.artifact_id, version)
    }

    /// Ids of everything stored, sorted.
    pub fn artifact_ids(&self) -> Vec<String> {
        let index = self.lock();
        let mut ids: Vec<String> = index.manifests.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (ArtifactStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        (store, dir)
    }

    fn meta(version: &str) -> ArtifactMeta {
        ArtifactMeta::new("plan", version, "project-planner")
    }

    #[test]
    fn put_is_content_addressed_and_idempotent() {
        let (store, _dir) = store();
        let first = store.put(b"{\"a\":1}", meta("1.0.0")).unwrap();
        let second = store.put(b"{\"a\":1}", meta("1.0.0")).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.manifest(&first).unwrap().refcount, 2);

        let other = store.put(b"{\"a\":2}", meta("1.0.0")).unwrap();
        assert_ne!(first, other);
    }

    #[test]
    fn artifact_id_equality_implies_content_equality() {
        let (store, _dir) = store();
        let id = store.put(b"payload", meta("1.0.0")).unwrap();
        let bytes = store.get(&id, None).unwrap();
        assert_eq!(bytes, b"payload");
        assert_eq!(id, content_hash(b"payload"));
    }

    #[test]
    fn versions_must_be_monotone() {
        let (store, _dir) = store();
        let id = store.put(b"x", meta("1.1.0")).unwrap();
        assert!(store.put(b"x", meta("1.2.0")).is_ok());
        let err = store.put(b"x", meta("1.0.0"));
        assert!(matches!(err, Err(StoreError::NonMonotoneVersion { .. })));
        assert_eq!(store.history(&id).unwrap().len(), 2);
    }

    #[test]
    fn invalid_semver_rejected() {
        let (store, _dir) = store();
        assert!(matches!(
            store.put(b"x", meta("not-a-version")),
            Err(StoreError::InvalidVersion { .. })
        ));
    }

    #[test]
    fn get_by_version() {
        let (store, _dir) = store();
        let id = store.put(b"x", meta("1.0.0")).unwrap();
        store.put(b"x", meta("2.0.0")).unwrap();
        assert_eq!(store.get(&id, Some("1.0.0")).unwrap(), b"x");
        assert!(matches!(
            store.get(&id, Some("9.9.9")),
            Err(StoreError::VersionNotFound { .. })
        ));
    }

    #[test]
    fn status_moves_forward_only_with_review_loop() {
        let (store, _dir) = store();
        let id = store.put(b"x", meta("1.0.0")).unwrap();
        store.set_status(&id, ArtifactStatus::InReview).unwrap();
        store.set_status(&id, ArtifactStatus::Draft).unwrap();
        store.set_status(&id, ArtifactStatus::Approved).unwrap();
        store.set_status(&id, ArtifactStatus::InUse).unwrap();
        assert!(matches!(
            store.set_status(&id, ArtifactStatus::Draft),
            Err(StoreError::InvalidStatusTransition { .. })
        ));
    }

    #[test]
    fn dependents_reverse_index() {
        let (store, _dir) = store();
        let base = store.put(b"base", meta("1.0.0")).unwrap();
        let child = store
            .put(
                b"child",
                meta("1.0.0").with_dependencies(vec![base.clone()]),
            )
            .unwrap();
        assert_eq!(store.dependents(&base), vec![child]);
        assert!(store.dependents("unknown").is_empty());
    }

    #[test]
    fn pointer_rollback_keeps_versions() {
        let (store, _dir) = store();
        let id = store.put(b"x", meta("1.0.0")).unwrap();
        store.put(b"x", meta("2.0.0")).unwrap();
        store.set_pointer("plan@current", &id, "2.0.0").unwrap();
        store.rollback("plan@current", "1.0.0").unwrap();

        let pointer = store.pointer("plan@current").unwrap();
        assert_eq!(pointer.version, "1.0.0");
        assert_eq!(store.history(&id).unwrap().len(), 2);
    }

    #[test]
    fn manifests_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = ArtifactStore::open(dir.path()).unwrap();
            store.put(b"persisted", meta("1.0.0")).unwrap()
        };
        let reopened = ArtifactStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get(&id, None).unwrap(), b"persisted");
        assert_eq!(reopened.manifest(&id).unwrap().kind, "plan");
    }
}
