//! Turn-by-turn records: extraction from monitors, persistence and rescaling.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::BeamConfig;
use crate::line::Line;
use crate::monitors::observed_element;
use crate::PrepError;

pub const MACHINE: &str = "lhc";

/// Samples of one particle (bunch), `x[bpm][turn]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransverseData {
    pub bpm_names: Vec<String>,
    pub x: Vec<Vec<f64>>,
    pub y: Vec<Vec<f64>>,
}

impl TransverseData {
    fn map(&self, f: &impl Fn(f64) -> f64) -> Self {
        let apply = |plane: &Vec<Vec<f64>>| -> Vec<Vec<f64>> {
            plane
                .iter()
                .map(|turns| turns.iter().map(|v| f(*v)).collect())
                .collect()
        };
        Self {
            bpm_names: self.bpm_names.clone(),
            x: apply(&self.x),
            y: apply(&self.y),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TbtData {
    pub machine: String,
    /// Acquisition time, RFC 3339.
    pub date: String,
    pub nturns: usize,
    pub bunch_ids: Vec<u32>,
    pub matrices: Vec<TransverseData>,
}

impl TbtData {
    /// Collects the samples of every monitor in `line`, one matrix per tracked particle.
    pub fn from_monitors(line: &Line) -> Result<Self, PrepError> {
        let monitors: Vec<_> = line.monitors().collect();
        let Some((_, first)) = monitors.first() else {
            return Err(PrepError::FormatAdaptation(format!(
                "line `{}` carries no particle monitors",
                line.name
            )));
        };
        let (nturns, particles) = (first.n_turns(), first.num_particles);
        if let Some((name, _)) = monitors
            .iter()
            .find(|(_, m)| m.n_turns() != nturns || m.num_particles != particles)
        {
            return Err(PrepError::FormatAdaptation(format!(
                "monitor `{name}` disagrees with the others on turns or particles"
            )));
        }

        let bpm_names: Vec<String> = monitors
            .iter()
            .map(|(name, _)| observed_element(name).to_ascii_uppercase())
            .collect();
        let matrices = (0..particles)
            .map(|p| TransverseData {
                bpm_names: bpm_names.clone(),
                x: monitors.iter().map(|(_, m)| m.particle_x(p).to_vec()).collect(),
                y: monitors.iter().map(|(_, m)| m.particle_y(p).to_vec()).collect(),
            })
            .collect();
        Ok(Self {
            machine: MACHINE.to_string(),
            date: chrono::Utc::now().to_rfc3339(),
            nturns,
            bunch_ids: (0..particles as u32).collect(),
            matrices,
        })
    }

    pub fn nbunches(&self) -> usize {
        self.matrices.len()
    }

    /// Copy with `f` applied to every sample of both planes.
    pub fn map_samples(&self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            matrices: self.matrices.iter().map(|m| m.map(&f)).collect(),
            ..self.clone()
        }
    }

    pub fn write(&self, path: &Path) -> Result<(), PrepError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string(self)?)?;
        info!(path = %path.display(), bunches = self.nbunches(), turns = self.nturns, "wrote turn-by-turn data");
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self, PrepError> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

pub fn file_name(beam: u8, name: &str) -> String {
    format!("Beam{beam}@BunchTurn@{name}.tbt.json")
}

pub fn tbt_path(config: &BeamConfig, name: &str) -> PathBuf {
    config.model_dir().join(file_name(config.beam(), name))
}

/// Quadratic BPM response.
pub fn nonlinear_scaling(x: f64, alpha: f64) -> f64 {
    x + alpha * x * x
}

pub fn modified_name(alpha: f64) -> String {
    format!("tracked_modified{alpha:.2}")
}

/// Rescales `data` (or the persisted `tracked` record) and writes the result.
pub fn modify_turn_by_turn_data(config: &BeamConfig, data: Option<TbtData>, alpha: f64) -> Result<TbtData, PrepError> {
    let data = match data {
        Some(data) => data,
        None => TbtData::read(&tbt_path(config, "tracked"))?,
    };
    let modified = data.map_samples(|x| nonlinear_scaling(x, alpha));
    modified.write(&tbt_path(config, &modified_name(alpha)))?;
    Ok(modified)
}
