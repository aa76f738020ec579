//! Staged driver: raw line, matched nominal line, errors, tracking, export and rescaling.
//!
//! Persisted stages are fingerprinted; a stage whose fingerprint and file are unchanged is
//! reloaded instead of recomputed unless `force` is set.

use std::fmt;
use std::fs;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::artifacts::{ArtifactStore, Fingerprint, FingerprintBuilder, Stage};
use crate::config::{BeamConfig, RunConfig};
use crate::export::{self, ModelDirExport};
use crate::line::Line;
use crate::loader;
use crate::matching::match_line;
use crate::perturb;
use crate::tbt::{self, TbtData};
use crate::tracking;
use crate::PrepError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Recompute stages even when their fingerprint is unchanged.
    pub force: bool,
    pub errors: bool,
    pub tracking: bool,
    pub export: bool,
    /// Rescale the tracked data with this quadratic coefficient.
    pub modify_alpha: Option<f64>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            force: false,
            errors: true,
            tracking: true,
            export: true,
            modify_alpha: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    CreateLine,
    Nominal,
    InstallErrors,
    Tracking,
    ModelDir,
    ModifyTbt,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Step::CreateLine => "create_line",
            Step::Nominal => "nominal",
            Step::InstallErrors => "install_errors",
            Step::Tracking => "tracking",
            Step::ModelDir => "model_dir",
            Step::ModifyTbt => "modify_tbt",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum Outcome {
    Done,
    /// Fingerprint unchanged; the artifact was reloaded.
    Skipped,
    Failed(String),
    /// Not attempted because an upstream step failed.
    Blocked(Step),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub step: Step,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub steps: Vec<StepReport>,
}

impl RunReport {
    pub fn outcome(&self, step: Step) -> Option<&Outcome> {
        self.steps.iter().rev().find(|r| r.step == step).map(|r| &r.outcome)
    }

    pub fn is_success(&self) -> bool {
        self.steps
            .iter()
            .all(|r| matches!(r.outcome, Outcome::Done | Outcome::Skipped))
    }
}

pub struct Pipeline {
    config: BeamConfig,
    run: RunConfig,
    store: ArtifactStore,
    report: RunReport,
}

impl Pipeline {
    /// Validates the run file, prepares the model directory and opens the artifact manifest.
    pub fn new(run: RunConfig) -> Result<Self, PrepError> {
        run.validate()?;
        let config = BeamConfig::new(run.beam.clone())?;
        let store = ArtifactStore::open(&config)?;
        Ok(Self {
            config,
            run,
            store,
            report: RunReport::default(),
        })
    }

    pub fn config(&self) -> &BeamConfig {
        &self.config
    }

    pub fn settings(&self) -> &RunConfig {
        &self.run
    }

    pub fn report(&self) -> &RunReport {
        &self.report
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    fn record<T>(&mut self, step: Step, result: &Result<T, PrepError>, skipped: bool) {
        let outcome = match result {
            Ok(_) if skipped => Outcome::Skipped,
            Ok(_) => Outcome::Done,
            Err(err) => {
                error!(%step, error = %err, "step failed");
                Outcome::Failed(err.to_string())
            }
        };
        self.report.steps.push(StepReport { step, outcome });
    }

    fn block(&mut self, step: Step, by: Step) {
        warn!(%step, blocked_by = %by, "step not attempted");
        self.report.steps.push(StepReport {
            step,
            outcome: Outcome::Blocked(by),
        });
    }

    /// Whether `line` is the artifact persisted for `stage`.
    fn is_persisted(&self, stage: Stage, line: &Line) -> bool {
        let path = self.config.line_path(stage);
        let Ok(text) = fs::read_to_string(&path) else {
            return false;
        };
        if serde_json::to_string_pretty(line).is_ok_and(|json| json == text) {
            return true;
        }
        Line::from_json(&path).is_ok_and(|persisted| persisted == *line)
    }

    fn upstream_identity(
        &self,
        builder: &mut FingerprintBuilder,
        upstream: Stage,
    ) -> Result<Option<Fingerprint>, PrepError> {
        match self.store.fingerprint(upstream) {
            Some(fp) => {
                builder.bytes("upstream", fp.as_str().as_bytes());
                Ok(Some(fp.clone()))
            }
            None => {
                builder.file("upstream", &self.config.line_path(upstream))?;
                Ok(None)
            }
        }
    }

    /// Fingerprint of `stage` and the upstream fingerprint it was derived from.
    ///
    /// A `handed` line that is not the persisted upstream artifact is hashed itself and has no
    /// upstream fingerprint.
    pub fn fingerprint(
        &self,
        stage: Stage,
        handed: Option<&Line>,
    ) -> Result<(Fingerprint, Option<Fingerprint>), PrepError> {
        let mut builder = FingerprintBuilder::new(stage);
        builder.json("config", self.config.settings())?;
        let dir = self.config.model_dir();
        let upstream = match stage.upstream() {
            None => {
                builder.file("sequence", &dir.join(loader::sequence_path(&self.config)))?;
                for (i, modifier) in self.config.modifier_paths().iter().enumerate() {
                    builder.file(&format!("modifier.{i}"), &dir.join(modifier))?;
                }
                builder.file("toolkit", &dir.join(loader::toolkit_path(&self.config)))?;
                None
            }
            Some(upstream) => match handed {
                Some(line) if !self.is_persisted(upstream, line) => {
                    debug!(%stage, %upstream, "handed line differs from the persisted upstream");
                    builder.json("upstream", line)?;
                    None
                }
                _ => self.upstream_identity(&mut builder, upstream)?,
            },
        };
        match stage {
            Stage::Nominal => {
                builder.json("matching", &self.run.matching)?;
            }
            Stage::WithErrors => {
                builder.json("errors", &self.run.errors)?;
                builder.json("matching", &self.run.matching)?;
            }
            Stage::Raw | Stage::WithMonitors => {}
        }
        Ok((builder.finish(), upstream))
    }

    /// The persisted line of `stage` when it can be reused.
    fn reusable(&self, stage: Stage, fingerprint: &Fingerprint) -> Result<Option<Line>, PrepError> {
        let path = self.config.line_path(stage);
        if self.run.pipeline.force || !self.store.is_current(stage, fingerprint, &path) {
            return Ok(None);
        }
        info!(%stage, %fingerprint, "stage is current; reloading");
        Line::from_json(&path).map(Some)
    }

    fn load(&self, stage: Stage) -> Result<Line, PrepError> {
        let path = self.config.line_path(stage);
        info!(%stage, path = %path.display(), "loading line");
        Line::from_json(&path)
    }

    /// Produces or reuses the `stage` artifact from the handed `input` line and records the step.
    fn persisted(
        &mut self,
        step: Step,
        stage: Stage,
        input: Option<Line>,
        produce: impl FnOnce(&Self, Option<Line>) -> Result<Line, PrepError>,
    ) -> Result<Line, PrepError> {
        let (result, skipped) = self.produce_stage(stage, input, produce);
        self.record(step, &result, skipped);
        result
    }

    fn produce_stage(
        &mut self,
        stage: Stage,
        input: Option<Line>,
        produce: impl FnOnce(&Self, Option<Line>) -> Result<Line, PrepError>,
    ) -> (Result<Line, PrepError>, bool) {
        let (fingerprint, upstream) = match self.fingerprint(stage, input.as_ref()) {
            Ok(parts) => parts,
            Err(err) => return (Err(err), false),
        };
        match self.reusable(stage, &fingerprint) {
            Ok(Some(line)) => return (Ok(line), true),
            Ok(None) => {}
            Err(err) => return (Err(err), false),
        }
        let result = produce(self, input).and_then(|line| {
            let path = self.config.line_path(stage);
            self.store
                .store(stage, fingerprint, &path, upstream)
                .map(|()| line)
        });
        (result, false)
    }

    pub fn create_line(&mut self) -> Result<Line, PrepError> {
        self.persisted(Step::CreateLine, Stage::Raw, None, |p, _| {
            loader::create_line(&p.config, &p.run.engine)
        })
    }

    /// Matches `line` (or the persisted raw line) and writes the nominal artifact.
    pub fn nominal(&mut self, line: Option<Line>) -> Result<Line, PrepError> {
        self.persisted(Step::Nominal, Stage::Nominal, line, |p, line| {
            let mut line = match line {
                Some(line) => line,
                None => p.load(Stage::Raw)?,
            };
            match_line(&p.config, &mut line, &p.run.matching)?;
            line.to_json(&p.config.line_path(Stage::Nominal))?;
            Ok(line)
        })
    }

    /// Installs the coupling errors on `line` (or the persisted nominal line) and re-matches.
    pub fn install_errors(&mut self, line: Option<Line>) -> Result<Line, PrepError> {
        self.persisted(Step::InstallErrors, Stage::WithErrors, line, |p, line| {
            let mut line = match line {
                Some(line) => line,
                None => p.load(Stage::Nominal)?,
            };
            let report = perturb::install_errors(&p.config, &mut line, &p.run.errors, &p.run.matching)?;
            info!(
                knobs = report.knobs.changes.len(),
                converged = report.matching.converged,
                "errors installed"
            );
            line.to_json(&p.config.line_path(Stage::WithErrors))?;
            Ok(line)
        })
    }

    /// Tracks `line` (or the configured source stage) and writes the turn-by-turn record.
    pub fn create_turn_by_turn_data(&mut self, line: Option<Line>) -> Result<TbtData, PrepError> {
        let result = match line {
            Some(line) => Ok(line),
            None => self.load(self.run.tracking.source),
        }
        .and_then(|line| tracking::create_turn_by_turn_data(&self.config, line, &self.run.tracking));
        self.record(Step::Tracking, &result, false);
        result
    }

    pub fn create_model_dir(&mut self, line: Option<&Line>) -> Result<ModelDirExport, PrepError> {
        let result = export::create_model_dir(&self.config, line, &self.run.export);
        self.record(Step::ModelDir, &result, false);
        result
    }

    pub fn modify_turn_by_turn_data(&mut self, data: Option<TbtData>, alpha: f64) -> Result<TbtData, PrepError> {
        let result = tbt::modify_turn_by_turn_data(&self.config, data, alpha);
        self.record(Step::ModifyTbt, &result, false);
        result
    }

    /// Runs every enabled step. A failure blocks the enabled steps that depend on it, naming the
    /// failed step as the cause; the model directory only needs the nominal line and is still
    /// written after an error-injection or tracking failure.
    pub fn run(&mut self) -> RunReport {
        self.report = RunReport::default();
        let options = self.run.pipeline.clone();

        let nominal = match self.create_line() {
            Ok(raw) => self.nominal(Some(raw)).map_err(|_| Step::Nominal),
            Err(_) => {
                self.block(Step::Nominal, Step::CreateLine);
                Err(Step::CreateLine)
            }
        };
        let nominal = match nominal {
            Ok(line) => line,
            Err(cause) => {
                if options.errors {
                    self.block(Step::InstallErrors, cause);
                }
                if options.tracking {
                    self.block(Step::Tracking, cause);
                }
                if options.export {
                    self.block(Step::ModelDir, cause);
                }
                if let Some(alpha) = options.modify_alpha {
                    if options.tracking {
                        self.block(Step::ModifyTbt, cause);
                    } else {
                        // failure is recorded in the report
                        let _ = self.modify_turn_by_turn_data(None, alpha);
                    }
                }
                return self.finish();
            }
        };

        let source = if options.errors {
            self.install_errors(Some(nominal.clone()))
                .map_err(|_| Step::InstallErrors)
        } else {
            Ok(nominal.clone())
        };

        // `Ok(None)`: tracking disabled, the persisted record is used
        let tracked = if options.tracking {
            match source {
                Ok(line) => self
                    .create_turn_by_turn_data(Some(line))
                    .map(Some)
                    .map_err(|_| Step::Tracking),
                Err(cause) => {
                    self.block(Step::Tracking, cause);
                    Err(cause)
                }
            }
        } else {
            Ok(None)
        };

        if options.export {
            let _ = self.create_model_dir(Some(&nominal));
        }

        if let Some(alpha) = options.modify_alpha {
            match tracked {
                Ok(data) => {
                    let _ = self.modify_turn_by_turn_data(data, alpha);
                }
                Err(cause) => self.block(Step::ModifyTbt, cause),
            }
        }
        self.finish()
    }

    fn finish(&self) -> RunReport {
        info!(success = self.report.is_success(), steps = self.report.steps.len(), "run finished");
        self.report.clone()
    }
}
