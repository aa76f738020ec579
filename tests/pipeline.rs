use std::path::Path;

use lattice_prep::export::{MODIFIERS_MADX, TWISS_DAT, TWISS_ELEMENTS_DAT};
use lattice_prep::matching::ConvergencePolicy;
use lattice_prep::optics::TwissOptions;
use lattice_prep::pipeline::{Outcome, Step};
use lattice_prep::tbt::{self, TbtData};
use lattice_prep::toy::{self, ToyMachine, OPTICS_FILE};
use lattice_prep::{twiss, BeamSettings, Line, Pipeline, RunConfig, Stage, TfsTable};

fn run_config(root: &Path) -> RunConfig {
    let acc = root.join("acc-models");
    toy::write_tree(&acc, "2025", &ToyMachine::default()).unwrap();
    let mut run = RunConfig::default();
    run.beam = BeamSettings {
        beam: 1,
        year: "2025".into(),
        model_dir: root.join("model"),
        modifiers: vec![OPTICS_FILE.to_string()],
        nat_tunes: [62.28, 60.31],
        energy: 6800.0,
        acc_models_root: acc,
        ..BeamSettings::default()
    };
    run.engine.command_log = None;
    run.engine.output_log = None;
    run
}

fn fractional(q: f64) -> f64 {
    q - q.floor()
}

#[test]
fn full_run_matches_and_writes_every_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let mut run = run_config(dir.path());
    run.matching.on_non_convergence = ConvergencePolicy::Fail;
    let tolerance = run.matching.tolerance;
    let mut pipeline = Pipeline::new(run).unwrap();
    let report = pipeline.run();
    assert!(report.is_success(), "{report:?}");
    for step in [Step::CreateLine, Step::Nominal, Step::InstallErrors, Step::Tracking, Step::ModelDir] {
        assert_eq!(report.outcome(step), Some(&Outcome::Done), "{step}");
    }

    let config = pipeline.config();
    let nominal_path = config.line_path(Stage::Nominal);
    assert!(nominal_path.is_file());
    let nominal = Line::from_json(&nominal_path).unwrap();
    let tw = twiss(&nominal, &TwissOptions::default()).unwrap();
    assert!((tw.qx - 62.28).abs() <= tolerance, "qx = {}", tw.qx);
    assert!((tw.qy - 60.31).abs() <= tolerance, "qy = {}", tw.qy);
    assert!((fractional(tw.qx) - 0.28).abs() < 1e-9);

    // reloading and re-saving gives the same optics
    let copy = dir.path().join("copy.json");
    nominal.to_json(&copy).unwrap();
    let again = Line::from_json(&copy).unwrap();
    assert_eq!(again.len(), nominal.len());
    assert!(again.element_names().eq(nominal.element_names()));
    let tw_again = twiss(&again, &TwissOptions::default()).unwrap();
    assert_eq!(tw_again.qx, tw.qx);
    assert_eq!(tw_again.qy, tw.qy);
    assert_eq!(again.knob_value("dqx.b1_op"), nominal.knob_value("dqx.b1_op"));

    // the injection marker starts the cycled line
    assert_eq!(nominal.element_names().next(), Some("msia.exit.b1"));

    // errors are installed and the tunes restored
    let with_errors = Line::from_json(&config.line_path(Stage::WithErrors)).unwrap();
    assert_eq!(with_errors.knob_value("cmrs.b1"), Some(2e-4));
    assert!(with_errors.has_skew_components());
    let tw_err = twiss(&with_errors, &TwissOptions::default()).unwrap();
    assert!((tw_err.qx - 62.28).abs() <= tolerance, "qx = {}", tw_err.qx);
    assert!((tw_err.qy - 60.31).abs() <= tolerance, "qy = {}", tw_err.qy);

    let data = TbtData::read(&tbt::tbt_path(config, "tracked")).unwrap();
    assert_eq!(data.nturns, 10);
    assert_eq!(data.matrices.len(), 1);
    assert_eq!(data.matrices[0].bpm_names.len(), 400);
    assert!(data.matrices[0].bpm_names.iter().all(|n| n.starts_with("BPM.") && !n.contains("DOROS")));

    let omc3 = config.model_dir().join("omc3_model");
    let elements = TfsTable::read(&omc3.join(TWISS_ELEMENTS_DAT)).unwrap();
    let bpms = TfsTable::read(&omc3.join(TWISS_DAT)).unwrap();
    assert_eq!(bpms.n_rows(), 400 + 40);
    assert!(elements.n_rows() > bpms.n_rows());
    assert!(elements.header("ENERGY").is_some());
    let modifiers = std::fs::read_to_string(omc3.join(MODIFIERS_MADX)).unwrap();
    let called: Vec<&str> = modifiers
        .lines()
        .map(|l| l.trim_start_matches("call, file = \"").trim_end_matches("\";"))
        .collect();
    assert_eq!(called, ["acc-models-lhc/operation/optics/opticsfile.toy.madx"]);
    for path in called {
        assert!(omc3.join(path).is_file(), "{path} not reachable from the export directory");
    }
    assert!(omc3.join("acc-models-lhc").join("lhc.seq").is_file());
}

#[test]
fn unchanged_stages_are_skipped_and_changed_settings_rerun() {
    let dir = tempfile::tempdir().unwrap();
    let mut run = run_config(dir.path());
    run.pipeline.tracking = false;
    run.pipeline.export = false;

    let first = Pipeline::new(run.clone()).unwrap().run();
    assert!(first.is_success(), "{first:?}");
    assert_eq!(first.outcome(Step::Nominal), Some(&Outcome::Done));

    let second = Pipeline::new(run.clone()).unwrap().run();
    for step in [Step::CreateLine, Step::Nominal, Step::InstallErrors] {
        assert_eq!(second.outcome(step), Some(&Outcome::Skipped), "{step}");
    }

    run.matching.tolerance = 1e-9;
    let third = Pipeline::new(run.clone()).unwrap().run();
    assert_eq!(third.outcome(Step::CreateLine), Some(&Outcome::Skipped));
    assert_eq!(third.outcome(Step::Nominal), Some(&Outcome::Done));
    assert_eq!(third.outcome(Step::InstallErrors), Some(&Outcome::Done));

    run.pipeline.force = true;
    let forced = Pipeline::new(run).unwrap().run();
    assert_eq!(forced.outcome(Step::CreateLine), Some(&Outcome::Done));
}

#[test]
fn modifying_persisted_tracking_data() {
    let dir = tempfile::tempdir().unwrap();
    let mut run = run_config(dir.path());
    run.pipeline.errors = false;
    run.pipeline.export = false;
    run.tracking.source = Stage::Nominal;
    run.pipeline.modify_alpha = Some(0.5);

    let mut pipeline = Pipeline::new(run).unwrap();
    let report = pipeline.run();
    assert!(report.is_success(), "{report:?}");
    assert_eq!(report.outcome(Step::ModifyTbt), Some(&Outcome::Done));

    let config = pipeline.config();
    let tracked = TbtData::read(&tbt::tbt_path(config, "tracked")).unwrap();
    let modified = TbtData::read(&tbt::tbt_path(config, &tbt::modified_name(0.5))).unwrap();
    let (x, x_mod) = (tracked.matrices[0].x[3][2], modified.matrices[0].x[3][2]);
    assert_eq!(x_mod, tbt::nonlinear_scaling(x, 0.5));
    assert!(x != 0.0);
}

#[test]
fn missing_modifier_fails_before_any_stage() {
    let dir = tempfile::tempdir().unwrap();
    let mut run = run_config(dir.path());
    run.beam.modifiers = vec!["missing.madx".to_string()];
    let err = Pipeline::new(run).err().unwrap();
    assert!(err.to_string().contains("missing.madx"));
}

#[test]
fn handed_line_is_used_even_when_the_stage_is_current() {
    let dir = tempfile::tempdir().unwrap();
    let mut run = run_config(dir.path());
    run.pipeline.tracking = false;
    run.pipeline.export = false;
    let mut pipeline = Pipeline::new(run).unwrap();
    assert!(pipeline.run().is_success());

    let raw = Line::from_json(&pipeline.config().line_path(Stage::Raw)).unwrap();
    let same = pipeline.nominal(Some(raw.clone())).unwrap();
    assert_eq!(pipeline.report().outcome(Step::Nominal), Some(&Outcome::Skipped));
    assert_eq!(same.name, "lhcb1");

    let mut other = raw;
    other.name = "handed_over".to_string();
    let matched = pipeline.nominal(Some(other)).unwrap();
    assert_eq!(pipeline.report().outcome(Step::Nominal), Some(&Outcome::Done));
    assert_eq!(matched.name, "handed_over");
    let persisted = Line::from_json(&pipeline.config().line_path(Stage::Nominal)).unwrap();
    assert_eq!(persisted.name, "handed_over");
}

#[test]
fn tracking_failure_still_exports_and_blocks_rescaling() {
    let dir = tempfile::tempdir().unwrap();
    let mut run = run_config(dir.path());
    run.tracking.monitor_pattern = "^nomatch$".to_string();
    run.pipeline.modify_alpha = Some(0.5);

    let report = Pipeline::new(run).unwrap().run();
    assert!(!report.is_success());
    assert_eq!(report.outcome(Step::InstallErrors), Some(&Outcome::Done));
    match report.outcome(Step::Tracking) {
        Some(Outcome::Failed(message)) => assert!(message.contains("^nomatch$"), "{message}"),
        other => panic!("tracking outcome {other:?}"),
    }
    assert_eq!(report.outcome(Step::ModelDir), Some(&Outcome::Done));
    assert_eq!(report.outcome(Step::ModifyTbt), Some(&Outcome::Blocked(Step::Tracking)));
}

#[test]
fn raw_failure_blocks_every_enabled_step() {
    let dir = tempfile::tempdir().unwrap();
    let mut run = run_config(dir.path());
    run.pipeline.modify_alpha = Some(0.5);
    let mut pipeline = Pipeline::new(run).unwrap();
    std::fs::remove_file(dir.path().join("acc-models/2025/lhc.seq")).unwrap();

    let report = pipeline.run();
    assert!(matches!(report.outcome(Step::CreateLine), Some(Outcome::Failed(_))));
    for step in [Step::Nominal, Step::InstallErrors, Step::Tracking, Step::ModelDir, Step::ModifyTbt] {
        assert_eq!(report.outcome(step), Some(&Outcome::Blocked(Step::CreateLine)), "{step}");
    }
    assert_eq!(report.steps.len(), 6);
}
