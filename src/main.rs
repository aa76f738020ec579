use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::info;

use lattice_prep::logging;
use lattice_prep::pipeline::Outcome;
use lattice_prep::toy::{self, ToyMachine};
use lattice_prep::{Pipeline, RunConfig};

#[derive(Debug, Parser)]
#[command(name = "lattice-prep", version)]
#[command(about = "Staged preparation of LHC-style lattice models")]
struct Cli {
    /// More output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Only warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// TOML run file
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    beam: Option<u8>,

    #[arg(long)]
    year: Option<String>,

    #[arg(long)]
    model_dir: Option<PathBuf>,

    /// Root of the machine-definition trees (`<root>/<year>` is linked)
    #[arg(long)]
    acc_models_root: Option<PathBuf>,

    /// Optics modifier; repeat for several
    #[arg(long = "modifier")]
    modifiers: Vec<String>,

    /// Recompute stages even when their fingerprint is unchanged
    #[arg(long, default_value_t = false)]
    force: bool,
}

impl RunArgs {
    fn load(&self) -> Result<RunConfig> {
        let mut run = match &self.config {
            Some(path) => RunConfig::from_toml_file(path)
                .with_context(|| format!("reading run file {}", path.display()))?,
            None => RunConfig::default(),
        };
        if let Some(beam) = self.beam {
            run.beam.beam = beam;
        }
        if let Some(year) = &self.year {
            run.beam.year = year.clone();
        }
        if let Some(dir) = &self.model_dir {
            run.beam.model_dir = dir.clone();
        }
        if let Some(root) = &self.acc_models_root {
            run.beam.acc_models_root = root.clone();
        }
        if !self.modifiers.is_empty() {
            run.beam.modifiers = self.modifiers.clone();
        }
        run.pipeline.force |= self.force;
        Ok(run)
    }

    fn pipeline(&self) -> Result<Pipeline> {
        let run = self.load()?;
        Pipeline::new(run).context("preparing the model directory")
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write a synthetic machine-definition tree
    Scaffold {
        #[arg(long)]
        root: PathBuf,
        #[arg(long, default_value = "2025")]
        year: String,
        #[arg(long)]
        cells: Option<usize>,
        #[arg(long)]
        base_tune: Option<f64>,
    },
    /// Import the sequence and write the raw line
    Line(RunArgs),
    /// Match the working point and write the nominal line
    Nominal(RunArgs),
    /// Install coupling errors and re-match
    Errors(RunArgs),
    /// Track one particle and write turn-by-turn data
    Track {
        #[command(flatten)]
        args: RunArgs,
        #[arg(long, default_value_t = 6600)]
        n_turns: usize,
        #[arg(long)]
        action: Option<f64>,
    },
    /// Write the analysis model directory
    Export(RunArgs),
    /// Apply the quadratic BPM response to the tracked data
    ModifyTbt {
        #[command(flatten)]
        args: RunArgs,
        #[arg(long)]
        alpha: f64,
    },
    /// Run every enabled step
    Run(RunArgs),
}

fn default_directive(cli: &Cli) -> &'static str {
    if cli.quiet {
        return "warn";
    }
    match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(default_directive(&cli));

    match cli.command {
        Command::Scaffold {
            root,
            year,
            cells,
            base_tune,
        } => {
            let mut machine = ToyMachine::default();
            if let Some(v) = cells {
                machine.cells = v;
            }
            if let Some(v) = base_tune {
                machine.base_tune = v;
            }
            let dir = toy::write_tree(&root, &year, &machine)
                .with_context(|| format!("writing machine tree under {}", root.display()))?;
            println!("Machine tree: {}", dir.display());
        }
        Command::Line(args) => {
            let line = args.pipeline()?.create_line()?;
            println!("Raw line: {} elements, {:.3} m", line.len(), line.length());
        }
        Command::Nominal(args) => {
            let mut pipeline = args.pipeline()?;
            let line = pipeline.nominal(None)?;
            let [qx, qy] = pipeline.config().nat_tunes();
            println!("Nominal line: {} elements, targets Q = ({qx}, {qy})", line.len());
        }
        Command::Errors(args) => {
            let line = args.pipeline()?.install_errors(None)?;
            println!("Line with errors: {} elements", line.len());
        }
        Command::Track {
            args,
            n_turns,
            action,
        } => {
            let mut run = args.load()?;
            run.tracking.n_turns = n_turns;
            if let Some(v) = action {
                run.tracking.action = v;
            }
            let mut pipeline = Pipeline::new(run).context("preparing the model directory")?;
            let data = pipeline.create_turn_by_turn_data(None)?;
            println!(
                "Turn-by-turn data: {} turns at {} BPMs",
                data.nturns,
                data.matrices.first().map_or(0, |m| m.bpm_names.len())
            );
        }
        Command::Export(args) => {
            let export = args.pipeline()?.create_model_dir(None)?;
            println!(
                "Model directory: {} ({} elements, {} BPMs)",
                export.dir.display(),
                export.elements,
                export.bpms
            );
        }
        Command::ModifyTbt { args, alpha } => {
            let data = args.pipeline()?.modify_turn_by_turn_data(None, alpha)?;
            println!("Rescaled turn-by-turn data: {} turns", data.nturns);
        }
        Command::Run(args) => {
            let mut pipeline = args.pipeline()?;
            let report = pipeline.run();
            for step in &report.steps {
                let outcome = match &step.outcome {
                    Outcome::Done => "done".to_string(),
                    Outcome::Skipped => "skipped (unchanged)".to_string(),
                    Outcome::Failed(message) => format!("failed: {message}"),
                    Outcome::Blocked(by) => format!("blocked by {by}"),
                };
                println!("{:<16} {outcome}", step.step.to_string());
            }
            if !report.is_success() {
                bail!("run finished with failed steps");
            }
            info!("all steps succeeded");
        }
    }
    Ok(())
}
