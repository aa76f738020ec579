//! Resolution of optics modifier references to files.
//!
//! A reference is tried, in order, as a path relative to the working directory, as a path
//! relative to the model directory, and as a file in the linked optics repository
//! (`<link>/operation/optics/<reference>`). The first existing file wins.

use std::env;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::ConfigError;

/// The three locations tried for `reference`. The last two are relative to `model_dir`.
pub fn candidate_paths(cwd: &Path, link: &str, reference: &str) -> [PathBuf; 3] {
    [
        cwd.join(reference),
        PathBuf::from(reference),
        Path::new(link)
            .join("operation")
            .join("optics")
            .join(reference),
    ]
}

pub fn resolve_modifier(model_dir: &Path, link: &str, reference: &str) -> Result<PathBuf, ConfigError> {
    let cwd = env::current_dir().map_err(ConfigError::WorkingDir)?;
    let candidates = candidate_paths(&cwd, link, reference);
    for candidate in &candidates {
        if model_dir.join(candidate).is_file() {
            debug!(reference, resolved = %candidate.display(), "resolved modifier");
            return Ok(candidate.clone());
        }
    }
    Err(ConfigError::ModifierNotFound {
        reference: reference.to_string(),
        attempted: candidates.into_iter().collect(),
    })
}

pub fn resolve_modifiers(model_dir: &Path, link: &str, references: &[String]) -> Result<Vec<PathBuf>, ConfigError> {
    references
        .iter()
        .map(|reference| resolve_modifier(model_dir, link, reference))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn model_with_link(dir: &Path) -> PathBuf {
        let optics = dir.join("tree/operation/optics");
        fs::create_dir_all(&optics).unwrap();
        fs::write(optics.join("R2025aRP_A30cmC30cm.madx"), "! optics\n").unwrap();
        let model = dir.join("model");
        fs::create_dir_all(&model).unwrap();
        std::os::unix::fs::symlink(dir.join("tree"), model.join("acc-models-lhc")).unwrap();
        model
    }

    #[test]
    fn optics_subtree_is_recorded_relative_to_model_dir() {
        let dir = tempfile::tempdir().unwrap();
        let model = model_with_link(dir.path());
        let path = resolve_modifier(&model, "acc-models-lhc", "R2025aRP_A30cmC30cm.madx").unwrap();
        assert_eq!(
            path,
            PathBuf::from("acc-models-lhc/operation/optics/R2025aRP_A30cmC30cm.madx")
        );
    }

    #[test]
    fn model_dir_relative_and_absolute_references() {
        let dir = tempfile::tempdir().unwrap();
        let model = model_with_link(dir.path());
        fs::write(model.join("local.madx"), "").unwrap();
        assert_eq!(
            resolve_modifier(&model, "acc-models-lhc", "local.madx").unwrap(),
            PathBuf::from("local.madx")
        );
        let absolute = dir.path().join("elsewhere.madx");
        fs::write(&absolute, "").unwrap();
        let reference = absolute.to_string_lossy().to_string();
        assert_eq!(resolve_modifier(&model, "acc-models-lhc", &reference).unwrap(), absolute);
    }

    #[test]
    fn missing_reference_names_all_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let model = model_with_link(dir.path());
        let err = resolve_modifier(&model, "acc-models-lhc", "nope.madx").unwrap_err();
        match &err {
            ConfigError::ModifierNotFound { reference, attempted } => {
                assert_eq!(reference, "nope.madx");
                assert_eq!(attempted.len(), 3);
            }
            other => panic!("unexpected error {other:?}"),
        }
        let message = err.to_string();
        assert!(message.contains("acc-models-lhc/operation/optics/nope.madx"));
    }

    #[test]
    fn order_is_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let model = model_with_link(dir.path());
        fs::write(model.join("b.madx"), "").unwrap();
        let refs = vec!["b.madx".to_string(), "R2025aRP_A30cmC30cm.madx".to_string()];
        let paths = resolve_modifiers(&model, "acc-models-lhc", &refs).unwrap();
        assert_eq!(paths[0], PathBuf::from("b.madx"));
        assert!(paths[1].ends_with("R2025aRP_A30cmC30cm.madx"));
    }
}
