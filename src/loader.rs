//! Sequence import and line extraction.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::artifacts::Stage;
use crate::config::BeamConfig;
use crate::engine::{BeamParameters, Engine, EngineSession, EngineSettings, ScriptEngine};
use crate::line::{Line, ReferenceParticle, TwissDefaults, TwissMethod};
use crate::PrepError;

pub const SYMMETRY_TOOLKIT: &str = "toolkit/remove-triplet-symmetry-knob.madx";

/// Sequence file as seen from the model directory, through the machine-definition link.
pub fn sequence_path(config: &BeamConfig) -> PathBuf {
    Path::new(config.acc_models_link()).join(config.sequence_file())
}

pub fn toolkit_path(config: &BeamConfig) -> PathBuf {
    Path::new(config.acc_models_link()).join(SYMMETRY_TOOLKIT)
}

fn beam_parameters(config: &BeamConfig, sequence: String, bv: i8) -> BeamParameters {
    BeamParameters {
        sequence,
        bv,
        energy: config.energy(),
        particle: "proton".to_string(),
        npart: config.n_particles(),
        kbunch: 1,
    }
}

/// Loads the sequence, cycles it at the injection point, declares both beams and applies the
/// modifiers and the symmetry toolkit, in that order.
pub fn load_sequence_and_optics<E: Engine>(
    config: &BeamConfig,
    session: &mut EngineSession<E>,
) -> Result<(), PrepError> {
    let sequence = config.sequence();
    session.engine()?.call(&sequence_path(config))?;

    let mut edit = session.seqedit(&sequence)?;
    edit.flatten()?;
    edit.cycle(config.cycling_element())?;
    edit.close()?;

    let engine = session.engine()?;
    engine.beam(&beam_parameters(config, sequence.clone(), config.bv()))?;
    engine.beam(&beam_parameters(
        config,
        format!("lhcb{}", config.other_beam()),
        -config.bv(),
    ))?;

    for modifier in config.modifier_paths() {
        engine.call(modifier)?;
    }
    engine.call(&toolkit_path(config))?;
    info!(sequence = %sequence, modifiers = config.modifier_paths().len(), "sequence and optics loaded");
    Ok(())
}

/// Extracts the subject sequence as a line, writes the `raw` artifact and terminates the
/// session.
pub fn create_line_with<E: Engine>(
    config: &BeamConfig,
    mut session: EngineSession<E>,
) -> Result<Line, PrepError> {
    load_sequence_and_optics(config, &mut session)?;
    let mut line = session.engine()?.sequence_to_line(&config.sequence())?;
    line.twiss_default = TwissDefaults {
        method: TwissMethod::FourD,
    };
    line.particle_ref = Some(ReferenceParticle::proton(config.energy() * 1e9));
    session.terminate()?;

    let path = config.line_path(Stage::Raw);
    line.to_json(&path)?;
    info!(path = %path.display(), elements = line.len(), "wrote raw line");
    Ok(line)
}

/// [`create_line_with`] on the in-process script engine working in the model directory.
pub fn create_line(config: &BeamConfig, settings: &EngineSettings) -> Result<Line, PrepError> {
    let engine = ScriptEngine::new(config.model_dir(), settings)?;
    create_line_with(config, EngineSession::new(engine))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BeamSettings;
    use crate::engine::tests::RecordingEngine;
    use crate::engine::EngineError;

    fn config(dir: &Path, beam: u8) -> BeamConfig {
        let root = dir.join("acc");
        std::fs::create_dir_all(root.join("2025")).unwrap();
        BeamConfig::new(BeamSettings {
            beam,
            year: "2025".into(),
            model_dir: dir.join("model"),
            acc_models_root: root,
            ..BeamSettings::default()
        })
        .unwrap()
    }

    #[test]
    fn commands_follow_the_loading_order() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), 2);
        let engine = RecordingEngine::default();
        let log = engine.log.clone();
        let mut session = EngineSession::new(engine);
        load_sequence_and_optics(&config, &mut session).unwrap();
        assert_eq!(
            log.borrow().as_slice(),
            [
                "call acc-models-lhc/lhc.seq",
                "seqedit lhcb2",
                "flatten",
                "cycle MKI.A5R8.B2",
                "endedit",
                "beam lhcb2 -1",
                "beam lhcb1 1",
                "call acc-models-lhc/toolkit/remove-triplet-symmetry-knob.madx",
            ]
        );
    }

    #[test]
    fn failure_closes_edit_and_carries_message() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), 4);
        let engine = RecordingEngine {
            fail_on: Some("cycle"),
            ..RecordingEngine::default()
        };
        let log = engine.log.clone();
        let result = create_line_with(&config, EngineSession::new(engine));
        match result {
            Err(PrepError::Engine(EngineError::Rejected { message, .. })) => {
                assert_eq!(message, "scripted failure")
            }
            other => panic!("unexpected result {other:?}"),
        }
        let log = log.borrow();
        assert_eq!(log[0], "call acc-models-lhc/lhcb4.seq");
        assert_eq!(&log[log.len() - 2..], ["endedit", "exit"]);
        assert!(!config.line_path(Stage::Raw).exists());
    }
}
