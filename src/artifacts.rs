//! Stage artifacts and their fingerprints.
//!
//! Every persisted stage records a SHA-256 fingerprint of what produced it: the stage name,
//! the canonical beam configuration, the identity of its upstream input and the stage
//! parameters. A stage whose recorded fingerprint matches and whose file exists is current.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::BeamConfig;
use crate::PrepError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Raw,
    Nominal,
    WithErrors,
    WithMonitors,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Raw => "raw",
            Stage::Nominal => "nominal",
            Stage::WithErrors => "with_errors",
            Stage::WithMonitors => "with_monitors",
        }
    }

    /// `with_monitors` only ever lives in memory.
    pub fn is_persisted(self) -> bool {
        !matches!(self, Stage::WithMonitors)
    }

    pub fn upstream(self) -> Option<Stage> {
        match self {
            Stage::Raw => None,
            Stage::Nominal => Some(Stage::Raw),
            Stage::WithErrors | Stage::WithMonitors => Some(Stage::Nominal),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Incremental fingerprint. Every part is length-prefixed and labelled.
pub struct FingerprintBuilder {
    hasher: Sha256,
}

impl FingerprintBuilder {
    pub fn new(stage: Stage) -> Self {
        let mut builder = Self {
            hasher: Sha256::new(),
        };
        builder.bytes("stage", stage.as_str().as_bytes());
        builder
    }

    pub fn bytes(&mut self, label: &str, data: &[u8]) -> &mut Self {
        self.hasher.update((label.len() as u64).to_le_bytes());
        self.hasher.update(label.as_bytes());
        self.hasher.update((data.len() as u64).to_le_bytes());
        self.hasher.update(data);
        self
    }

    pub fn json<T: Serialize>(&mut self, label: &str, value: &T) -> Result<&mut Self, PrepError> {
        let data = serde_json::to_vec(value)?;
        Ok(self.bytes(label, &data))
    }

    pub fn file(&mut self, label: &str, path: &Path) -> Result<&mut Self, PrepError> {
        let data = fs::read(path)?;
        Ok(self.bytes(label, &data))
    }

    pub fn finish(&self) -> Fingerprint {
        Fingerprint(hex::encode(self.hasher.clone().finalize()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub fingerprint: Fingerprint,
    pub file: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<Fingerprint>,
    pub written_at: String,
}

/// Manifest of persisted stages, stored next to the artifacts.
#[derive(Debug)]
pub struct ArtifactStore {
    manifest: PathBuf,
    records: BTreeMap<Stage, ArtifactRecord>,
}

impl ArtifactStore {
    pub fn manifest_path(config: &BeamConfig) -> PathBuf {
        config
            .model_dir()
            .join(format!("artifacts.lhc.b{}.json", config.beam()))
    }

    pub fn open(config: &BeamConfig) -> Result<Self, PrepError> {
        Self::open_at(Self::manifest_path(config))
    }

    pub fn open_at(manifest: PathBuf) -> Result<Self, PrepError> {
        let records = if manifest.is_file() {
            serde_json::from_str(&fs::read_to_string(&manifest)?)?
        } else {
            BTreeMap::new()
        };
        Ok(Self { manifest, records })
    }

    pub fn record(&self, stage: Stage) -> Option<&ArtifactRecord> {
        self.records.get(&stage)
    }

    pub fn fingerprint(&self, stage: Stage) -> Option<&Fingerprint> {
        self.records.get(&stage).map(|r| &r.fingerprint)
    }

    /// True when `stage` was last produced with `fingerprint` and its file still exists.
    pub fn is_current(&self, stage: Stage, fingerprint: &Fingerprint, file: &Path) -> bool {
        self.records
            .get(&stage)
            .is_some_and(|r| &r.fingerprint == fingerprint && r.file == file && file.is_file())
    }

    pub fn store(
        &mut self,
        stage: Stage,
        fingerprint: Fingerprint,
        file: &Path,
        upstream: Option<Fingerprint>,
    ) -> Result<(), PrepError> {
        debug!(%stage, %fingerprint, "recording artifact");
        self.records.insert(
            stage,
            ArtifactRecord {
                fingerprint,
                file: file.to_path_buf(),
                upstream,
                written_at: chrono::Utc::now().to_rfc3339(),
            },
        );
        self.save()
    }

    fn save(&self) -> Result<(), PrepError> {
        if let Some(parent) = self.manifest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.manifest, serde_json::to_string_pretty(&self.records)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprints_depend_on_every_part() {
        let base = FingerprintBuilder::new(Stage::Nominal)
            .bytes("upstream", b"abc")
            .finish();
        let same = FingerprintBuilder::new(Stage::Nominal)
            .bytes("upstream", b"abc")
            .finish();
        let other_stage = FingerprintBuilder::new(Stage::WithErrors)
            .bytes("upstream", b"abc")
            .finish();
        let other_data = FingerprintBuilder::new(Stage::Nominal)
            .bytes("upstream", b"abd")
            .finish();
        let shifted = FingerprintBuilder::new(Stage::Nominal)
            .bytes("upstrea", b"mabc")
            .finish();
        assert_eq!(base, same);
        assert_ne!(base, other_stage);
        assert_ne!(base, other_data);
        assert_ne!(base, shifted);
        assert_eq!(base.as_str().len(), 64);
    }

    #[test]
    fn store_persists_and_checks_files() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("artifacts.lhc.b1.json");
        let artifact = dir.path().join("line.lhc.b1.raw.json");
        let fp = FingerprintBuilder::new(Stage::Raw).finish();

        let mut store = ArtifactStore::open_at(manifest.clone()).unwrap();
        store.store(Stage::Raw, fp.clone(), &artifact, None).unwrap();
        assert!(!store.is_current(Stage::Raw, &fp, &artifact), "file missing");

        fs::write(&artifact, "{}").unwrap();
        let reopened = ArtifactStore::open_at(manifest).unwrap();
        assert!(reopened.is_current(Stage::Raw, &fp, &artifact));
        let other = FingerprintBuilder::new(Stage::Nominal).finish();
        assert!(!reopened.is_current(Stage::Raw, &other, &artifact));
        assert!(reopened.fingerprint(Stage::Nominal).is_none());
    }

    #[test]
    fn stage_names_and_chain() {
        assert_eq!(Stage::WithErrors.to_string(), "with_errors");
        assert_eq!(Stage::Nominal.upstream(), Some(Stage::Raw));
        assert!(!Stage::WithMonitors.is_persisted());
        let json = serde_json::to_string(&Stage::WithMonitors).unwrap();
        assert_eq!(json, "\"with_monitors\"");
    }
}
