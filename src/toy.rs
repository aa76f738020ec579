//! Synthetic machine-definition tree.
//!
//! Writes a small FODO collider in the layout the loader expects:
//!
//! ```text
//! <root>/<year>/lhc.seq
//! <root>/<year>/lhcb4.seq
//! <root>/<year>/toolkit/remove-triplet-symmetry-knob.madx
//! <root>/<year>/operation/optics/opticsfile.toy.madx
//! ```
//!
//! Tune knobs `dqx.b<n>_op`/`dqy.b<n>_op` and chromaticity knobs `dqpx.b<n>_op`/`dqpy.b<n>_op`
//! are linear around the base working point; coupling knobs `cmrs.b<n>`/`cmis.b<n>` power a few
//! skew quadrupoles.

use std::f64::consts::PI;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::loader::SYMMETRY_TOOLKIT;
use crate::PrepError;

pub const OPTICS_FILE: &str = "opticsfile.toy.madx";

const QUAD_LENGTH: f64 = 3.1;
const SEXT_LENGTH: f64 = 0.37;
const BEND_LENGTH: f64 = 14.3;
const SKEW_LENGTH: f64 = 0.32;
const SKEW_SPACING: usize = 25;
const DOROS_SPACING: usize = 10;

/// Offsets of the element centres from the start of a half cell [m].
const QUAD_AT: f64 = 1.55;
const SEXT_AT: f64 = 3.6;
const BPM_AT: f64 = 4.2;
const DOROS_AT: f64 = 4.7;
const BEND_A_AT: f64 = 20.0;
const BEND_B_AT: f64 = 45.0;
const MARKER_AT: f64 = 30.0;
const SKEW_AT: f64 = 60.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToyMachine {
    pub cells: usize,
    pub cell_length: f64,
    /// Tune of both planes with all operational knobs at zero.
    pub base_tune: f64,
}

impl Default for ToyMachine {
    fn default() -> Self {
        Self {
            cells: 200,
            cell_length: 133.0,
            base_tune: 61.3,
        }
    }
}

/// Thin-lens periodic optics of one cell.
#[derive(Debug, Clone, Copy)]
struct CellOptics {
    k1l: f64,
    beta_max: f64,
    beta_min: f64,
    disp_max: f64,
    disp_min: f64,
}

impl ToyMachine {
    pub fn circumference(&self) -> f64 {
        self.cells as f64 * self.cell_length
    }

    fn bend_angle(&self) -> f64 {
        2.0 * PI / (4 * self.cells) as f64
    }

    fn cell_optics(&self) -> CellOptics {
        let n = self.cells as f64;
        let l = self.cell_length;
        let mu = 2.0 * PI * self.base_tune / n;
        let s = (mu / 2.0).sin();
        let theta = 2.0 * self.bend_angle();
        let half = l / 2.0;
        CellOptics {
            k1l: 4.0 * s / l,
            beta_max: l * (1.0 + s) / mu.sin(),
            beta_min: l * (1.0 - s) / mu.sin(),
            disp_max: half * theta * (1.0 + s / 2.0) / (s * s),
            disp_min: half * theta * (1.0 - s / 2.0) / (s * s),
        }
    }

    /// Knob definitions of one beam.
    fn knob_block(&self, beam: u8) -> String {
        let n = self.cells as f64;
        let o = self.cell_optics();
        let c = 4.0 * PI / (n * (o.beta_max - o.beta_min * o.beta_min / o.beta_max));
        let r = o.beta_min / o.beta_max;

        let scale = n / (4.0 * PI);
        let m = [
            [scale * o.beta_max * o.disp_max, scale * o.beta_min * o.disp_min],
            [-scale * o.beta_min * o.disp_max, -scale * o.beta_max * o.disp_min],
        ];
        let det = m[0][0] * m[1][1] - m[0][1] * m[1][0];
        let inv = [[m[1][1] / det, -m[0][1] / det], [-m[1][0] / det, m[0][0] / det]];

        let b = format!("b{beam}");
        let mut out = String::new();
        let _ = writeln!(out, "dqx.{b}_op = 0;\ndqy.{b}_op = 0;\ndqpx.{b}_op = 0;\ndqpy.{b}_op = 0;");
        let _ = writeln!(out, "cmrs.{b} = 0;\ncmis.{b} = 0;");
        let _ = writeln!(
            out,
            "kqf.{b} := {:e} + ({:e}) * dqx.{b}_op + ({:e}) * dqy.{b}_op;",
            o.k1l / QUAD_LENGTH,
            c / QUAD_LENGTH,
            r * c / QUAD_LENGTH
        );
        let _ = writeln!(
            out,
            "kqd.{b} := ({:e}) + ({:e}) * dqx.{b}_op + ({:e}) * dqy.{b}_op;",
            -o.k1l / QUAD_LENGTH,
            -r * c / QUAD_LENGTH,
            -c / QUAD_LENGTH
        );
        let _ = writeln!(
            out,
            "ksf.{b} := ({:e}) * dqpx.{b}_op + ({:e}) * dqpy.{b}_op;",
            inv[0][0] / SEXT_LENGTH,
            inv[0][1] / SEXT_LENGTH
        );
        let _ = writeln!(
            out,
            "ksd.{b} := ({:e}) * dqpx.{b}_op + ({:e}) * dqpy.{b}_op;",
            inv[1][0] / SEXT_LENGTH,
            inv[1][1] / SEXT_LENGTH
        );
        out
    }

    fn class_block(&self, beam: u8) -> String {
        let b = format!("b{beam}");
        let mut out = String::new();
        let _ = writeln!(out, "mq.f.{b}: quadrupole, l = {QUAD_LENGTH}, k1 := kqf.{b};");
        let _ = writeln!(out, "mq.d.{b}: quadrupole, l = {QUAD_LENGTH}, k1 := kqd.{b};");
        let _ = writeln!(out, "ms.f.{b}: sextupole, l = {SEXT_LENGTH}, k2 := ksf.{b};");
        let _ = writeln!(out, "ms.d.{b}: sextupole, l = {SEXT_LENGTH}, k2 := ksd.{b};");
        let _ = writeln!(out, "mb.{b}: sbend, l = {BEND_LENGTH}, angle = {:e};", self.bend_angle());
        let _ = writeln!(out, "mqs.r.{b}: quadrupole, l = {SKEW_LENGTH}, k1s := 5 * cmrs.{b};");
        let _ = writeln!(out, "mqs.i.{b}: quadrupole, l = {SKEW_LENGTH}, k1s := 5 * cmis.{b};");
        out
    }

    fn sequence_block(&self, beam: u8) -> String {
        let b = format!("b{beam}");
        let half = self.cell_length / 2.0;
        let mut out = String::new();
        let _ = writeln!(
            out,
            "lhc{b}: sequence, l = {}, refer = centre;",
            self.circumference()
        );
        let marker = |out: &mut String, name: &str, cell: usize| {
            let at = cell as f64 * self.cell_length + MARKER_AT;
            let _ = writeln!(out, "  {name}: marker, at = {at};");
        };
        for cell in 0..self.cells {
            let start = cell as f64 * self.cell_length;
            for (half_idx, tag) in [(0usize, 'f'), (1, 'd')] {
                let s0 = start + half_idx as f64 * half;
                let id = format!("{cell}{tag}.{b}");
                let _ = writeln!(out, "  mq.{id}: mq.{tag}.{b}, at = {};", s0 + QUAD_AT);
                let _ = writeln!(out, "  ms.{id}: ms.{tag}.{b}, at = {};", s0 + SEXT_AT);
                let _ = writeln!(out, "  bpm.{id}: monitor, at = {};", s0 + BPM_AT);
                if cell % DOROS_SPACING == 0 {
                    let _ = writeln!(out, "  bpm.{id}_doros: monitor, at = {};", s0 + DOROS_AT);
                }
                let _ = writeln!(out, "  mb.a{id}: mb.{b}, at = {};", s0 + BEND_A_AT);
                let _ = writeln!(out, "  mb.b{id}: mb.{b}, at = {};", s0 + BEND_B_AT);
                if half_idx == 0 && cell % SKEW_SPACING == 0 {
                    let family = if (cell / SKEW_SPACING) % 2 == 0 { 'r' } else { 'i' };
                    let _ = writeln!(out, "  mqs.{cell}.{b}: mqs.{family}.{b}, at = {};", s0 + SKEW_AT);
                }
            }
        }
        marker(&mut out, "ip1", 0);
        marker(&mut out, "ip5", self.cells / 2);
        match beam {
            1 => marker(&mut out, "msia.exit.b1", self.cells / 10),
            _ => marker(&mut out, "mki.a5r8.b2", self.cells * 3 / 4),
        }
        out.push_str("endsequence;\n");
        out
    }

    fn beam_block(&self, beam: u8) -> String {
        format!(
            "! beam {beam}\n{}{}{}",
            self.knob_block(beam),
            self.class_block(beam),
            self.sequence_block(beam)
        )
    }

    /// Source of `lhc.seq`: both beams in their own orientation.
    pub fn lhc_seq(&self) -> String {
        format!("! toy collider\n{}{}", self.beam_block(1), self.beam_block(2))
    }

    /// Source of `lhcb4.seq`: beam 2 only.
    pub fn lhcb4_seq(&self) -> String {
        format!("! toy collider, beam 4\n{}", self.beam_block(2))
    }
}

/// Writes the tree for `year` under `root` and returns `<root>/<year>`.
pub fn write_tree(root: &Path, year: &str, machine: &ToyMachine) -> Result<PathBuf, PrepError> {
    let dir = root.join(year);
    fs::create_dir_all(dir.join("toolkit"))?;
    fs::create_dir_all(dir.join("operation/optics"))?;
    fs::write(dir.join("lhc.seq"), machine.lhc_seq())?;
    fs::write(dir.join("lhcb4.seq"), machine.lhcb4_seq())?;
    fs::write(
        dir.join(SYMMETRY_TOOLKIT),
        "! decouple the triplet knobs from their symmetric partners\nkqx.r1 = 0;\nkqx.l1 := kqx.r1;\n",
    )?;
    fs::write(
        dir.join("operation/optics").join(OPTICS_FILE),
        "! operational knobs at their reference values\ndqx.b1_op = 0;\ndqy.b1_op = 0;\ndqx.b2_op = 0;\ndqy.b2_op = 0;\n",
    )?;
    info!(dir = %dir.display(), cells = machine.cells, "wrote machine-definition tree");
    Ok(dir)
}
