//! Linear uncoupled optics of a [`Line`].
//!
//! Magnets are modelled as a thin kick between two half drifts. The horizontal plane carries
//! dispersion through 3x3 maps acting on `(x, px, delta)`. Chromaticity is the first-order
//! perturbative sum over quadrupole and sextupole kicks. Skew terms and closed-orbit offsets are
//! not part of this model.

use std::f64::consts::PI;
use std::fmt;

use nalgebra::{Matrix2, Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::line::{Element, ElementKind, Line, TwissMethod};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Plane {
    X,
    Y,
}

impl fmt::Display for Plane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Plane::X => f.write_str("horizontal"),
            Plane::Y => f.write_str("vertical"),
        }
    }
}

#[derive(Debug, Error)]
pub enum OpticsError {
    #[error("line `{0}` has no elements")]
    EmptyLine(String),
    #[error("no stable periodic solution in the {plane} plane (cos mu = {cos_mu})")]
    Unstable { plane: Plane, cos_mu: f64 },
    #[error("periodic dispersion is undefined (integer horizontal tune)")]
    SingularDispersion,
    #[error("twiss method {0:?} is not supported")]
    UnsupportedMethod(TwissMethod),
}

#[derive(Debug, Clone, Copy)]
pub struct TwissOptions {
    pub strengths: bool,
    pub chromaticity: bool,
}

impl Default for TwissOptions {
    fn default() -> Self {
        Self {
            strengths: false,
            chromaticity: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwissRow {
    pub name: String,
    pub keyword: String,
    pub s: f64,
    pub x: f64,
    pub y: f64,
    pub betx: f64,
    pub bety: f64,
    pub alfx: f64,
    pub alfy: f64,
    pub dx: f64,
    pub dpx: f64,
    pub dy: f64,
    pub dpy: f64,
    pub mux: f64,
    pub muy: f64,
    pub length: f64,
    pub k0l: f64,
    pub k0sl: f64,
    pub k1l: f64,
    pub k1sl: f64,
    pub k2l: f64,
    pub k2sl: f64,
}

/// Float columns of a [`TwissTable`], in table order.
pub const OPTICS_COLUMNS: [&str; 15] = [
    "s", "x", "y", "betx", "bety", "alfx", "alfy", "dx", "dpx", "dy", "dpy", "mux", "muy", "length",
    "k0l",
];

const STRENGTH_COLUMNS: [&str; 5] = ["k0sl", "k1l", "k1sl", "k2l", "k2sl"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwissTable {
    pub line: String,
    pub circumference: f64,
    pub qx: f64,
    pub qy: f64,
    pub dqx: Option<f64>,
    pub dqy: Option<f64>,
    pub has_strengths: bool,
    pub rows: Vec<TwissRow>,
}

impl TwissTable {
    pub fn row(&self, name: &str) -> Option<&TwissRow> {
        self.rows.iter().find(|r| r.name == name)
    }

    pub fn column_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = OPTICS_COLUMNS
            .iter()
            .copied()
            .filter(|c| *c != "k0l" || self.has_strengths)
            .collect();
        if self.has_strengths {
            names.extend(STRENGTH_COLUMNS);
        }
        names
    }

    pub fn float_column(&self, name: &str) -> Option<Vec<f64>> {
        let strength = name == "k0l" || STRENGTH_COLUMNS.contains(&name);
        if strength && !self.has_strengths {
            return None;
        }
        let get: fn(&TwissRow) -> f64 = match name {
            "s" => |r| r.s,
            "x" => |r| r.x,
            "y" => |r| r.y,
            "betx" => |r| r.betx,
            "bety" => |r| r.bety,
            "alfx" => |r| r.alfx,
            "alfy" => |r| r.alfy,
            "dx" => |r| r.dx,
            "dpx" => |r| r.dpx,
            "dy" => |r| r.dy,
            "dpy" => |r| r.dpy,
            "mux" => |r| r.mux,
            "muy" => |r| r.muy,
            "length" => |r| r.length,
            "k0l" => |r| r.k0l,
            "k0sl" => |r| r.k0sl,
            "k1l" => |r| r.k1l,
            "k1sl" => |r| r.k1sl,
            "k2l" => |r| r.k2l,
            "k2sl" => |r| r.k2sl,
            _ => return None,
        };
        Some(self.rows.iter().map(get).collect())
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Strengths {
    k0l: f64,
    k1l: f64,
    k1sl: f64,
    k2l: f64,
}

fn strengths(element: &Element) -> Strengths {
    match &element.kind {
        ElementKind::Magnet(m) => Strengths {
            k0l: m.k0l.value,
            k1l: m.k1l.value,
            k1sl: m.k1sl.value,
            k2l: m.k2l.value,
        },
        _ => Strengths::default(),
    }
}

fn drift_x(l: f64) -> Matrix3<f64> {
    Matrix3::new(1.0, l, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0)
}

fn drift_y(l: f64) -> Matrix2<f64> {
    Matrix2::new(1.0, l, 0.0, 1.0)
}

/// Horizontal `(x, px, delta)` and vertical `(y, py)` maps of one element.
fn element_maps(element: &Element) -> (Matrix3<f64>, Matrix2<f64>) {
    let l = element.length;
    match &element.kind {
        ElementKind::Magnet(_) => {
            let k = strengths(element);
            let half_x = drift_x(l / 2.0);
            let half_y = drift_y(l / 2.0);
            let kick_x = Matrix3::new(1.0, 0.0, 0.0, -k.k1l, 1.0, k.k0l, 0.0, 0.0, 1.0);
            let kick_y = Matrix2::new(1.0, 0.0, k.k1l, 1.0);
            (half_x * kick_x * half_x, half_y * kick_y * half_y)
        }
        _ => (drift_x(l), drift_y(l)),
    }
}

#[derive(Debug, Clone, Copy)]
struct PlaneState {
    beta: f64,
    alfa: f64,
    mu: f64,
}

impl PlaneState {
    fn periodic(m: &Matrix2<f64>, plane: Plane) -> Result<Self, OpticsError> {
        let cos_mu = 0.5 * (m[(0, 0)] + m[(1, 1)]);
        if !cos_mu.is_finite() || cos_mu.abs() >= 1.0 {
            return Err(OpticsError::Unstable { plane, cos_mu });
        }
        let sin_mu = m[(0, 1)].signum() * (1.0 - cos_mu * cos_mu).sqrt();
        Ok(Self {
            beta: m[(0, 1)] / sin_mu,
            alfa: (m[(0, 0)] - m[(1, 1)]) / (2.0 * sin_mu),
            mu: 0.0,
        })
    }

    fn gamma(&self) -> f64 {
        (1.0 + self.alfa * self.alfa) / self.beta
    }

    fn propagate(&self, m: &Matrix2<f64>) -> Self {
        let (m11, m12, m21, m22) = (m[(0, 0)], m[(0, 1)], m[(1, 0)], m[(1, 1)]);
        let gamma = self.gamma();
        let beta = m11 * m11 * self.beta - 2.0 * m11 * m12 * self.alfa + m12 * m12 * gamma;
        let alfa = -m11 * m21 * self.beta + (m11 * m22 + m12 * m21) * self.alfa - m12 * m22 * gamma;
        let dmu = m12.atan2(m11 * self.beta - m12 * self.alfa);
        Self {
            beta,
            alfa,
            mu: self.mu + dmu,
        }
    }

    /// Beta function after a drift of length `h`.
    fn beta_after_drift(&self, h: f64) -> f64 {
        self.beta - 2.0 * self.alfa * h + self.gamma() * h * h
    }
}

/// Computes the periodic optics of `line` at its first element.
pub fn twiss(line: &Line, options: &TwissOptions) -> Result<TwissTable, OpticsError> {
    if line.twiss_default.method != TwissMethod::FourD {
        return Err(OpticsError::UnsupportedMethod(line.twiss_default.method));
    }
    if line.is_empty() {
        return Err(OpticsError::EmptyLine(line.name.clone()));
    }

    let maps: Vec<(Matrix3<f64>, Matrix2<f64>)> = line.elements().iter().map(element_maps).collect();
    let mut one_turn_x = Matrix3::identity();
    let mut one_turn_y = Matrix2::identity();
    for (mx, my) in &maps {
        one_turn_x = mx * one_turn_x;
        one_turn_y = my * one_turn_y;
    }
    let one_turn_xx = one_turn_x.fixed_view::<2, 2>(0, 0).into_owned();

    let mut x = PlaneState::periodic(&one_turn_xx, Plane::X)?;
    let mut y = PlaneState::periodic(&one_turn_y, Plane::Y)?;

    let disp_rhs = Vector2::new(one_turn_x[(0, 2)], one_turn_x[(1, 2)]);
    let disp0 = (Matrix2::identity() - one_turn_xx)
        .try_inverse()
        .ok_or(OpticsError::SingularDispersion)?
        * disp_rhs;
    let mut disp = Vector3::new(disp0[0], disp0[1], 1.0);

    let mut rows = Vec::with_capacity(line.len());
    let mut s = 0.0;
    let (mut chroma_x, mut chroma_y) = (0.0, 0.0);
    for (element, (mx, my)) in line.elements().iter().zip(&maps) {
        let k = strengths(element);
        rows.push(TwissRow {
            name: element.name.clone(),
            keyword: element.keyword.clone(),
            s,
            x: 0.0,
            y: 0.0,
            betx: x.beta,
            bety: y.beta,
            alfx: x.alfa,
            alfy: y.alfa,
            dx: disp[0],
            dpx: disp[1],
            dy: 0.0,
            dpy: 0.0,
            mux: x.mu / (2.0 * PI),
            muy: y.mu / (2.0 * PI),
            length: element.length,
            k0l: k.k0l,
            k0sl: 0.0,
            k1l: k.k1l,
            k1sl: k.k1sl,
            k2l: k.k2l,
            k2sl: 0.0,
        });

        if options.chromaticity && (k.k1l != 0.0 || k.k2l != 0.0) {
            let h = element.length / 2.0;
            let betx = x.beta_after_drift(h);
            let bety = y.beta_after_drift(h);
            let d = disp[0] + disp[1] * h;
            chroma_x += betx * (k.k2l * d - k.k1l);
            chroma_y += bety * (k.k1l - k.k2l * d);
        }

        x = x.propagate(&mx.fixed_view::<2, 2>(0, 0).into_owned());
        y = y.propagate(my);
        disp = mx * disp;
        s += element.length;
    }

    let (dqx, dqy) = if options.chromaticity {
        (Some(chroma_x / (4.0 * PI)), Some(chroma_y / (4.0 * PI)))
    } else {
        (None, None)
    };

    Ok(TwissTable {
        line: line.name.clone(),
        circumference: s,
        qx: x.mu / (2.0 * PI),
        qy: y.mu / (2.0 * PI),
        dqx,
        dqy,
        has_strengths: options.strengths,
        rows,
    })
}
