//! Staged preparation of LHC-style lattice models.
//!
//! A run resolves the beam configuration and its modifier files, imports the sequence through a
//! command-language [`engine`], matches the working point, installs coupling errors, tracks a
//! particle for turn-by-turn data and exports the optics for analysis tools. Each stage writes
//! a fingerprinted artifact so unchanged stages are reloaded instead of recomputed.

pub mod artifacts;
pub mod config;
pub mod engine;
pub mod export;
pub mod expr;
pub mod knobs;
pub mod line;
pub mod loader;
pub mod logging;
pub mod matching;
pub mod modifiers;
pub mod monitors;
pub mod optics;
pub mod perturb;
pub mod pipeline;
pub mod tbt;
pub mod tfs;
pub mod toy;
pub mod tracking;

use thiserror::Error;

pub use artifacts::{ArtifactStore, Fingerprint, Stage};
pub use config::{BeamConfig, BeamSettings, ConfigError, RunConfig};
pub use engine::{Engine, EngineError, EngineSession, ScriptEngine};
pub use knobs::{KnobError, KnobGraph};
pub use line::{Line, LineError};
pub use matching::{MatchReport, MatchSettings};
pub use optics::{twiss, OpticsError, TwissTable};
pub use pipeline::{Outcome, Pipeline, RunReport, Step};
pub use tbt::TbtData;
pub use tfs::{TfsError, TfsTable};

#[derive(Debug, Error)]
pub enum PrepError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("engine: {0}")]
    Engine(#[from] EngineError),
    #[error("expression: {0}")]
    Expr(#[from] expr::ExprError),
    #[error("knob: {0}")]
    Knob(#[from] KnobError),
    #[error("line: {0}")]
    Line(#[from] LineError),
    #[error("optics: {0}")]
    Optics(#[from] OpticsError),
    #[error("tfs: {0}")]
    Tfs(#[from] TfsError),
    #[error("matching did not converge after {iterations} iterations: {detail}")]
    MatchNotConverged { iterations: usize, detail: String },
    #[error("no element matches `{pattern}`")]
    Selection { pattern: String },
    #[error("cannot adapt data: {0}")]
    FormatAdaptation(String),
    #[error("solver: {0}")]
    Solver(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid pattern: {0}")]
    Regex(#[from] regex::Error),
}
