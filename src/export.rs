//! Export of the nominal optics into an analysis model directory.
//!
//! The directory `omc3_<model_dir_name>` receives `twiss_elements.dat` (magnets, monitors and
//! interaction points), `twiss.dat` (monitors only), `modifiers.madx` and a copy of the
//! machine-definition link.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::artifacts::Stage;
use crate::config::{link_acc_models, BeamConfig, ConfigError};
use crate::line::Line;
use crate::optics::{twiss, TwissOptions, TwissTable};
use crate::tfs::{Column, HeaderValue, TfsTable};
use crate::PrepError;

pub const TWISS_ELEMENTS_DAT: &str = "twiss_elements.dat";
pub const TWISS_DAT: &str = "twiss.dat";
pub const MODIFIERS_MADX: &str = "modifiers.madx";

const BASE_COLUMNS: [&str; 19] = [
    "NAME", "KEYWORD", "S", "X", "Y", "L", "LRAD", "BETX", "BETY", "ALFX", "ALFY", "DX", "DY", "MUX", "MUY",
    "R11", "R12", "R21", "R22",
];

/// Exported columns in output order: the base set followed by `K0L K0SL ... K7L K7SL`.
pub fn twiss_columns() -> Vec<String> {
    let mut columns: Vec<String> = BASE_COLUMNS.iter().map(|c| c.to_string()).collect();
    for order in 0..8 {
        columns.push(format!("K{order}L"));
        columns.push(format!("K{order}SL"));
    }
    columns
}

/// Magnets, monitors and interaction points.
fn is_exported(name: &str) -> bool {
    ["M", "BPM", "IP"].iter().any(|prefix| name.starts_with(prefix))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    /// Drop float columns that are zero in every row.
    pub drop_zero_columns: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelDirExport {
    pub dir: PathBuf,
    pub elements: usize,
    pub bpms: usize,
}

fn upper_name(name: &str) -> String {
    match name {
        "length" => "L".to_string(),
        other => other.to_ascii_uppercase(),
    }
}

/// Converts an optics table into the analysis layout: upper-case names and columns, filtered
/// rows, fixed column order and tune headers.
pub fn twiss_to_table(tw: &TwissTable) -> Result<TfsTable, PrepError> {
    let shape = |message: String| PrepError::FormatAdaptation(message);
    if !tw.column_names().contains(&"betx") {
        return Err(shape("optics table has no betx column".to_string()));
    }

    let keep: Vec<usize> = tw
        .rows
        .iter()
        .enumerate()
        .filter(|(_, row)| is_exported(&row.name.to_ascii_uppercase()))
        .map(|(i, _)| i)
        .collect();

    let available: Vec<(String, &'static str)> = tw
        .column_names()
        .into_iter()
        .map(|c| (upper_name(c), c))
        .collect();

    let mut table = TfsTable::new();
    table.set_header("Q1", HeaderValue::Float(tw.qx));
    table.set_header("Q2", HeaderValue::Float(tw.qy));
    if let (Some(dqx), Some(dqy)) = (tw.dqx, tw.dqy) {
        table.set_header("DQ1", HeaderValue::Float(dqx));
        table.set_header("DQ2", HeaderValue::Float(dqy));
    }

    for column in twiss_columns() {
        let data = match column.as_str() {
            "NAME" => Column::Str(keep.iter().map(|&i| tw.rows[i].name.to_ascii_uppercase()).collect()),
            "KEYWORD" => Column::Str(keep.iter().map(|&i| tw.rows[i].keyword.to_ascii_uppercase()).collect()),
            _ => {
                let Some((_, source)) = available.iter().find(|(upper, _)| *upper == column) else {
                    continue;
                };
                let values = tw
                    .float_column(source)
                    .ok_or_else(|| shape(format!("column `{source}` listed but not readable")))?;
                if values.len() != tw.rows.len() {
                    return Err(shape(format!(
                        "column `{source}` has {} values for {} rows",
                        values.len(),
                        tw.rows.len()
                    )));
                }
                Column::Float(keep.iter().map(|&i| values[i]).collect())
            }
        };
        table
            .push_column(&column, data)
            .map_err(|err| shape(err.to_string()))?;
    }
    Ok(table)
}

fn export_dir(config: &BeamConfig) -> Result<PathBuf, PrepError> {
    let model_dir = fs::canonicalize(config.model_dir())?;
    let name = model_dir
        .file_name()
        .ok_or_else(|| ConfigError::Invalid(format!("model directory {} has no name", model_dir.display())))?;
    Ok(config
        .model_dir()
        .join(format!("omc3_{}", name.to_string_lossy())))
}

/// One `call` per resolved modifier. Paths relative to the model directory stay valid from the
/// export directory because the acc-models link is recreated there.
fn write_modifiers(path: &Path, modifiers: &[PathBuf]) -> Result<(), PrepError> {
    let text: String = modifiers
        .iter()
        .map(|m| format!("call, file = \"{}\";\n", m.display()))
        .collect();
    fs::write(path, text)?;
    Ok(())
}

/// Writes the model directory from `line`, or from the persisted `nominal` line.
pub fn create_model_dir(
    config: &BeamConfig,
    line: Option<&Line>,
    settings: &ExportSettings,
) -> Result<ModelDirExport, PrepError> {
    let loaded;
    let line = match line {
        Some(line) => line,
        None => {
            debug!("loading nominal line");
            loaded = Line::from_json(&config.line_path(Stage::Nominal))?;
            &loaded
        }
    };

    let dir = export_dir(config)?;
    fs::create_dir_all(&dir)?;

    let tw = twiss(
        line,
        &TwissOptions {
            strengths: true,
            chromaticity: true,
        },
    )?;
    let mut table = twiss_to_table(&tw)?;
    table.set_header("ENERGY", HeaderValue::Float(config.energy()));
    if settings.drop_zero_columns {
        let dropped = table.drop_all_zero_columns();
        debug!(columns = %dropped.join(" "), "dropped all-zero columns");
    }
    let bpms = table
        .filter_rows("NAME", |name| name.starts_with("BPM"))
        .ok_or_else(|| PrepError::FormatAdaptation("exported table has no NAME column".to_string()))?;

    table.write(&dir.join(TWISS_ELEMENTS_DAT))?;
    bpms.write(&dir.join(TWISS_DAT))?;
    write_modifiers(&dir.join(MODIFIERS_MADX), config.modifier_paths())?;

    let target = fs::read_link(config.model_dir().join(config.acc_models_link()))?;
    link_acc_models(&dir, config.acc_models_link(), &target)?;

    info!(
        dir = %dir.display(),
        elements = table.n_rows(),
        bpms = bpms.n_rows(),
        "wrote model directory"
    );
    Ok(ModelDirExport {
        dir,
        elements: table.n_rows(),
        bpms: bpms.n_rows(),
    })
}
