use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::artifacts::Stage;
use crate::engine::EngineSettings;
use crate::export::ExportSettings;
use crate::line::PROTON_MASS_EV;
use crate::matching::MatchSettings;
use crate::modifiers;
use crate::perturb::ErrorSettings;
use crate::pipeline::PipelineSettings;
use crate::tracking::TrackingSettings;
use crate::PrepError;

pub const DEFAULT_ACC_MODELS_ROOT: &str = "/afs/cern.ch/eng/acc-models/lhc";
pub const DEFAULT_ACC_MODELS_LINK: &str = "acc-models-lhc";

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("beam must be 1, 2 or 4, got {0}")]
    InvalidBeam(u8),
    #[error("modifier `{reference}` not found; tried {}", display_paths(.attempted))]
    ModifierNotFound {
        reference: String,
        attempted: Vec<PathBuf>,
    },
    #[error("cannot create model directory {path}: {source}")]
    ModelDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot link {link} -> {target}: {source}")]
    Link {
        link: PathBuf,
        target: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{0} exists and is not a symbolic link")]
    LinkBlocked(PathBuf),
    #[error("cannot determine the working directory: {0}")]
    WorkingDir(#[source] io::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Normalized emittance, either shared by both planes or given per plane as `[ex, ey]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NormalizedEmittance {
    Both(f64),
    PerPlane([f64; 2]),
}

impl NormalizedEmittance {
    pub fn planes(&self) -> [f64; 2] {
        match *self {
            NormalizedEmittance::Both(e) => [e, e],
            NormalizedEmittance::PerPlane(planes) => planes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeamSettings {
    pub beam: u8,
    pub year: String,
    pub model_dir: PathBuf,
    pub modifiers: Vec<String>,
    pub nat_tunes: [f64; 2],
    pub chroma: f64,
    /// Beam energy [GeV].
    pub energy: f64,
    pub emittance_norm: NormalizedEmittance,
    pub n_particles: f64,
    pub acc_models_root: PathBuf,
    pub acc_models_link: String,
}

impl Default for BeamSettings {
    fn default() -> Self {
        Self {
            beam: 1,
            year: String::new(),
            model_dir: PathBuf::new(),
            modifiers: Vec::new(),
            nat_tunes: [62.28, 60.31],
            chroma: 3.0,
            energy: 6800.0,
            emittance_norm: NormalizedEmittance::Both(2.5e-6),
            n_particles: 1.5e11,
            acc_models_root: PathBuf::from(DEFAULT_ACC_MODELS_ROOT),
            acc_models_link: DEFAULT_ACC_MODELS_LINK.to_string(),
        }
    }
}

impl BeamSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.beam, 1 | 2 | 4) {
            return Err(ConfigError::InvalidBeam(self.beam));
        }
        if self.year.trim().is_empty() {
            return Err(ConfigError::Invalid("beam.year must be set".to_string()));
        }
        if self.model_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("beam.model_dir must be set".to_string()));
        }
        if self.acc_models_link.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "beam.acc_models_link must not be empty".to_string(),
            ));
        }
        if !self.nat_tunes.iter().all(|q| q.is_finite() && *q > 0.0) {
            return Err(ConfigError::Invalid(
                "beam.nat_tunes must be finite and positive".to_string(),
            ));
        }
        if !self.chroma.is_finite() {
            return Err(ConfigError::Invalid("beam.chroma must be finite".to_string()));
        }
        if !(self.energy.is_finite() && self.energy * 1e9 > PROTON_MASS_EV) {
            return Err(ConfigError::Invalid(
                "beam.energy must exceed the proton rest energy".to_string(),
            ));
        }
        if !self
            .emittance_norm
            .planes()
            .iter()
            .all(|e| e.is_finite() && *e > 0.0)
        {
            return Err(ConfigError::Invalid(
                "beam.emittance_norm must be positive".to_string(),
            ));
        }
        if !(self.n_particles.is_finite() && self.n_particles > 0.0) {
            return Err(ConfigError::Invalid(
                "beam.n_particles must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Validated beam configuration. Construction prepares the model directory.
#[derive(Debug, Clone, Serialize)]
pub struct BeamConfig {
    #[serde(flatten)]
    settings: BeamSettings,
    modifier_paths: Vec<PathBuf>,
    emittance: [f64; 2],
    rel_energy_spread: f64,
}

impl BeamConfig {
    /// Creates the model directory, links the machine-definition tree into it, resolves the
    /// modifiers and derives the beam quantities, in that order.
    pub fn new(settings: BeamSettings) -> Result<Self, ConfigError> {
        settings.validate()?;

        fs::create_dir_all(&settings.model_dir).map_err(|source| ConfigError::ModelDir {
            path: settings.model_dir.clone(),
            source,
        })?;
        let target = settings.acc_models_root.join(&settings.year);
        link_acc_models(&settings.model_dir, &settings.acc_models_link, &target)?;

        let modifier_paths = modifiers::resolve_modifiers(
            &settings.model_dir,
            &settings.acc_models_link,
            &settings.modifiers,
        )?;
        if modifier_paths.len() != settings.modifiers.len() {
            return Err(ConfigError::Invalid(format!(
                "resolved {} of {} modifiers",
                modifier_paths.len(),
                settings.modifiers.len()
            )));
        }

        let [enx, eny] = settings.emittance_norm.planes();
        let gamma = settings.energy * 1e9 / PROTON_MASS_EV;
        let beta_gamma = (gamma * gamma - 1.0).sqrt();
        let emittance = [enx / beta_gamma, eny / beta_gamma];
        let rel_energy_spread = 4.5e-4 * (450.0 / settings.energy).sqrt();

        info!(
            beam = settings.beam,
            year = %settings.year,
            model_dir = %settings.model_dir.display(),
            modifiers = modifier_paths.len(),
            "beam configuration ready"
        );
        Ok(Self {
            settings,
            modifier_paths,
            emittance,
            rel_energy_spread,
        })
    }

    pub fn settings(&self) -> &BeamSettings {
        &self.settings
    }

    pub fn beam(&self) -> u8 {
        self.settings.beam
    }

    pub fn year(&self) -> &str {
        &self.settings.year
    }

    pub fn model_dir(&self) -> &Path {
        &self.settings.model_dir
    }

    pub fn acc_models_link(&self) -> &str {
        &self.settings.acc_models_link
    }

    pub fn acc_models_target(&self) -> PathBuf {
        self.settings.acc_models_root.join(&self.settings.year)
    }

    pub fn modifiers(&self) -> &[String] {
        &self.settings.modifiers
    }

    /// Resolved modifier files in application order; relative paths are relative to the model
    /// directory.
    pub fn modifier_paths(&self) -> &[PathBuf] {
        &self.modifier_paths
    }

    pub fn nat_tunes(&self) -> [f64; 2] {
        self.settings.nat_tunes
    }

    pub fn chroma(&self) -> f64 {
        self.settings.chroma
    }

    pub fn energy(&self) -> f64 {
        self.settings.energy
    }

    pub fn n_particles(&self) -> f64 {
        self.settings.n_particles
    }

    /// Physical emittance per plane [m].
    pub fn emittance(&self) -> [f64; 2] {
        self.emittance
    }

    pub fn rel_energy_spread(&self) -> f64 {
        self.rel_energy_spread
    }

    pub fn sequence(&self) -> String {
        match self.settings.beam {
            4 => "lhcb2".to_string(),
            beam => format!("lhcb{beam}"),
        }
    }

    pub fn sequence_file(&self) -> &'static str {
        match self.settings.beam {
            4 => "lhcb4.seq",
            _ => "lhc.seq",
        }
    }

    pub fn cycling_element(&self) -> &'static str {
        match self.settings.beam {
            1 => "MSIA.EXIT.B1",
            _ => "MKI.A5R8.B2",
        }
    }

    pub fn other_beam(&self) -> u8 {
        match self.settings.beam {
            2 | 4 => 1,
            _ => 2,
        }
    }

    pub fn bv(&self) -> i8 {
        match self.settings.beam {
            2 => -1,
            _ => 1,
        }
    }

    /// `<dir>/<kind>.lhc.b<beam>.<id><suffix>`; `dir` defaults to the model directory and
    /// `suffix` to `.tfs`.
    pub fn output_path(&self, kind: &str, id: &str, dir: Option<&Path>, suffix: Option<&str>) -> PathBuf {
        let dir = dir.unwrap_or(&self.settings.model_dir);
        let suffix = suffix.unwrap_or(".tfs");
        dir.join(format!("{kind}.lhc.b{}.{id}{suffix}", self.settings.beam))
    }

    pub fn line_path(&self, stage: Stage) -> PathBuf {
        self.output_path("line", stage.as_str(), None, Some(".json"))
    }
}

/// Creates or replaces `<dir>/<link_name>` pointing at `target`.
pub(crate) fn link_acc_models(dir: &Path, link_name: &str, target: &Path) -> Result<PathBuf, ConfigError> {
    let link = dir.join(link_name);
    let link_error = |source: io::Error| ConfigError::Link {
        link: link.clone(),
        target: target.to_path_buf(),
        source,
    };
    match fs::symlink_metadata(&link) {
        Ok(meta) if meta.file_type().is_symlink() => {
            debug!(link = %link.display(), "replacing existing link");
            fs::remove_file(&link).map_err(link_error)?;
        }
        Ok(_) => return Err(ConfigError::LinkBlocked(link.clone())),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(link_error(err)),
    }
    symlink_dir(target, &link).map_err(link_error)?;
    Ok(link)
}

#[cfg(unix)]
fn symlink_dir(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink_dir(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

/// Complete run file: every table is optional except `[beam]` with `model_dir` and `year`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub beam: BeamSettings,
    pub engine: EngineSettings,
    pub matching: MatchSettings,
    pub errors: ErrorSettings,
    pub tracking: TrackingSettings,
    pub export: ExportSettings,
    pub pipeline: PipelineSettings,
}

impl RunConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, PrepError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, PrepError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.beam.validate()?;
        self.matching.validate()?;
        self.errors.validate()?;
        self.tracking.validate()?;
        Ok(())
    }
}
