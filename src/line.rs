//! Beam line model: ordered elements, the knob graph their strengths depend on, the reference
//! particle and twiss defaults. Lines persist as JSON.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::expr::Expr;
use crate::knobs::{KnobEdit, KnobError, KnobGraph, KnobReport};
use crate::PrepError;

/// Proton rest energy [eV].
pub const PROTON_MASS_EV: f64 = 938_272_088.16;

const POSITION_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Error)]
pub enum LineError {
    #[error("element `{0}` is not part of the line")]
    UnknownElement(String),
    #[error("element name `{0}` is already used in the line")]
    DuplicateElement(String),
    #[error("placement before `{anchor}` requested at s = {requested} but the element starts at s = {actual}")]
    PositionMismatch {
        anchor: String,
        requested: f64,
        actual: f64,
    },
    #[error("strength of element `{element}`: {source}")]
    Strength {
        element: String,
        #[source]
        source: crate::expr::ExprError,
    },
}

/// Integrated strength: a literal, or an expression over knobs with its cached value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Param {
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<Expr>,
}

impl Param {
    pub fn literal(value: f64) -> Self {
        Self { value, expr: None }
    }

    pub fn deferred(expr: Expr, value: f64) -> Self {
        Self {
            value,
            expr: Some(expr),
        }
    }

    fn depends_on(&self, knobs: &BTreeSet<String>) -> bool {
        self.expr
            .as_ref()
            .is_some_and(|expr| expr.variables().iter().any(|v| knobs.contains(v)))
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Multipole {
    #[serde(default)]
    pub k0l: Param,
    #[serde(default)]
    pub k1l: Param,
    #[serde(default)]
    pub k1sl: Param,
    #[serde(default)]
    pub k2l: Param,
}

impl Multipole {
    fn params_mut(&mut self) -> [&mut Param; 4] {
        [&mut self.k0l, &mut self.k1l, &mut self.k1sl, &mut self.k2l]
    }

    fn params(&self) -> [&Param; 4] {
        [&self.k0l, &self.k1l, &self.k1sl, &self.k2l]
    }
}

/// Per-turn position recorder. Samples are laid out `[particle][turn - start_at_turn]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticleMonitor {
    pub start_at_turn: usize,
    pub stop_at_turn: usize,
    pub num_particles: usize,
    #[serde(skip)]
    pub x: Vec<f64>,
    #[serde(skip)]
    pub y: Vec<f64>,
}

impl ParticleMonitor {
    pub fn new(start_at_turn: usize, stop_at_turn: usize, num_particles: usize) -> Self {
        let size = stop_at_turn.saturating_sub(start_at_turn) * num_particles;
        Self {
            start_at_turn,
            stop_at_turn,
            num_particles,
            x: vec![0.0; size],
            y: vec![0.0; size],
        }
    }

    pub fn n_turns(&self) -> usize {
        self.stop_at_turn.saturating_sub(self.start_at_turn)
    }

    pub(crate) fn record(&mut self, particle: usize, turn: usize, x: f64, y: f64) {
        if particle >= self.num_particles || turn < self.start_at_turn || turn >= self.stop_at_turn {
            return;
        }
        let n_turns = self.n_turns();
        if self.x.len() != n_turns * self.num_particles {
            self.x = vec![0.0; n_turns * self.num_particles];
            self.y = vec![0.0; n_turns * self.num_particles];
        }
        let idx = particle * n_turns + (turn - self.start_at_turn);
        self.x[idx] = x;
        self.y[idx] = y;
    }

    pub fn particle_x(&self, particle: usize) -> &[f64] {
        let n = self.n_turns();
        &self.x[particle * n..(particle + 1) * n]
    }

    pub fn particle_y(&self, particle: usize) -> &[f64] {
        let n = self.n_turns();
        &self.y[particle * n..(particle + 1) * n]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ElementKind {
    Drift,
    Marker,
    Magnet(Multipole),
    Monitor(ParticleMonitor),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub name: String,
    pub keyword: String,
    #[serde(default)]
    pub length: f64,
    pub kind: ElementKind,
}

impl Element {
    pub fn drift(name: impl Into<String>, length: f64) -> Self {
        Self {
            name: name.into(),
            keyword: "drift".to_string(),
            length,
            kind: ElementKind::Drift,
        }
    }

    pub fn marker(name: impl Into<String>, keyword: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keyword: keyword.into(),
            length: 0.0,
            kind: ElementKind::Marker,
        }
    }

    pub fn monitor(name: impl Into<String>, monitor: ParticleMonitor) -> Self {
        Self {
            name: name.into(),
            keyword: "particlemonitor".to_string(),
            length: 0.0,
            kind: ElementKind::Monitor(monitor),
        }
    }

    pub fn multipole(&self) -> Option<&Multipole> {
        match &self.kind {
            ElementKind::Magnet(m) => Some(m),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReferenceParticle {
    /// Reference momentum times c [eV].
    pub p0c: f64,
    pub q0: f64,
    /// Rest energy [eV].
    pub mass0: f64,
}

impl ReferenceParticle {
    pub fn proton(p0c: f64) -> Self {
        Self {
            p0c,
            q0: 1.0,
            mass0: PROTON_MASS_EV,
        }
    }

    pub fn gamma0(&self) -> f64 {
        (self.p0c * self.p0c + self.mass0 * self.mass0).sqrt() / self.mass0
    }

    pub fn beta0(&self) -> f64 {
        self.p0c / (self.p0c * self.p0c + self.mass0 * self.mass0).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TwissMethod {
    #[default]
    #[serde(rename = "4d")]
    FourD,
    #[serde(rename = "6d")]
    SixD,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TwissDefaults {
    pub method: TwissMethod,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Line {
    pub name: String,
    elements: Vec<Element>,
    knobs: KnobGraph,
    #[serde(default)]
    pub particle_ref: Option<ReferenceParticle>,
    #[serde(default)]
    pub twiss_default: TwissDefaults,
}

/// One element to insert directly before `anchor`, which must start at `s`.
#[derive(Debug, Clone)]
pub struct Placement {
    pub anchor: String,
    pub s: f64,
    pub element: Element,
}

impl Line {
    pub fn new(name: impl Into<String>, elements: Vec<Element>, knobs: KnobGraph) -> Result<Self, PrepError> {
        let mut seen = BTreeSet::new();
        for element in &elements {
            if !seen.insert(element.name.as_str()) {
                return Err(LineError::DuplicateElement(element.name.clone()).into());
            }
        }
        let mut line = Self {
            name: name.into(),
            elements,
            knobs,
            particle_ref: None,
            twiss_default: TwissDefaults::default(),
        };
        line.refresh_all()?;
        Ok(line)
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub(crate) fn elements_mut(&mut self) -> &mut [Element] {
        &mut self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn element(&self, name: &str) -> Option<&Element> {
        self.elements.iter().find(|e| e.name == name)
    }

    pub fn element_names(&self) -> impl Iterator<Item = &str> {
        self.elements.iter().map(|e| e.name.as_str())
    }

    pub fn knobs(&self) -> &KnobGraph {
        &self.knobs
    }

    pub fn knob_value(&self, name: &str) -> Option<f64> {
        self.knobs.value(&name.to_ascii_lowercase())
    }

    /// Entry positions of every element.
    pub fn s_positions(&self) -> Vec<f64> {
        let mut s = 0.0;
        self.elements
            .iter()
            .map(|e| {
                let here = s;
                s += e.length;
                here
            })
            .collect()
    }

    pub fn length(&self) -> f64 {
        self.elements.iter().map(|e| e.length).sum()
    }

    /// Elements whose names match `pattern`, with their entry positions.
    pub fn select(&self, pattern: &Regex) -> Vec<(String, f64)> {
        self.elements
            .iter()
            .zip(self.s_positions())
            .filter(|(e, _)| pattern.is_match(&e.name))
            .map(|(e, s)| (e.name.clone(), s))
            .collect()
    }

    pub fn has_skew_components(&self) -> bool {
        self.elements
            .iter()
            .filter_map(Element::multipole)
            .any(|m| m.k1sl.value != 0.0)
    }

    pub fn monitors(&self) -> impl Iterator<Item = (&str, &ParticleMonitor)> {
        self.elements.iter().filter_map(|e| match &e.kind {
            ElementKind::Monitor(m) => Some((e.name.as_str(), m)),
            _ => None,
        })
    }

    /// Opens a declared knob edit; element strengths are refreshed when it closes.
    pub fn edit_knobs<I, S>(&mut self, independent: I) -> Result<LineEdit<'_>, KnobError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let edit = self.knobs.edit(independent)?;
        Ok(LineEdit {
            edit: Some(edit),
            elements: &mut self.elements,
        })
    }

    fn refresh_all(&mut self) -> Result<(), LineError> {
        let knobs = &self.knobs;
        for element in &mut self.elements {
            if let ElementKind::Magnet(m) = &mut element.kind {
                for param in m.params_mut() {
                    if let Some(expr) = &param.expr {
                        param.value = knobs.eval(expr).map_err(|source| LineError::Strength {
                            element: element.name.clone(),
                            source,
                        })?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Inserts all placements in one pass over the element list.
    pub fn insert_batch(&mut self, placements: Vec<Placement>) -> Result<(), PrepError> {
        let index: HashMap<&str, usize> = self
            .elements
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name.as_str(), i))
            .collect();
        let positions = self.s_positions();
        let mut new_names = BTreeSet::new();
        let mut before: BTreeMap<usize, Vec<Element>> = BTreeMap::new();
        for placement in placements {
            let idx = *index
                .get(placement.anchor.as_str())
                .ok_or_else(|| LineError::UnknownElement(placement.anchor.clone()))?;
            let actual = positions[idx];
            if (actual - placement.s).abs() > POSITION_TOLERANCE {
                return Err(LineError::PositionMismatch {
                    anchor: placement.anchor,
                    requested: placement.s,
                    actual,
                }
                .into());
            }
            let name = placement.element.name.clone();
            if index.contains_key(name.as_str()) || !new_names.insert(name.clone()) {
                return Err(LineError::DuplicateElement(name).into());
            }
            before.entry(idx).or_default().push(placement.element);
        }
        let inserted = new_names.len();

        let old = std::mem::take(&mut self.elements);
        let mut rebuilt = Vec::with_capacity(old.len() + inserted);
        for (idx, element) in old.into_iter().enumerate() {
            if let Some(extra) = before.remove(&idx) {
                rebuilt.extend(extra);
            }
            rebuilt.push(element);
        }
        self.elements = rebuilt;
        debug!(line = %self.name, inserted, "inserted elements");
        Ok(())
    }

    pub fn to_json(&self, path: &Path) -> Result<(), PrepError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn from_json(path: &Path) -> Result<Self, PrepError> {
        let text = fs::read_to_string(path)?;
        let mut line: Line = serde_json::from_str(&text)?;
        line.refresh_all()?;
        Ok(line)
    }
}

/// Knob edit on a line. Closing it re-evaluates dependent knobs and then every element
/// strength that references a changed knob.
pub struct LineEdit<'l> {
    edit: Option<KnobEdit<'l>>,
    elements: &'l mut Vec<Element>,
}

impl<'l> LineEdit<'l> {
    pub fn set(&mut self, name: &str, value: f64) -> Result<(), KnobError> {
        match self.edit.as_mut() {
            Some(edit) => edit.set(name, value),
            None => Ok(()),
        }
    }

    pub fn override_expression(&mut self, name: &str, value: f64) -> Result<(), KnobError> {
        match self.edit.as_mut() {
            Some(edit) => edit.override_expression(name, value),
            None => Ok(()),
        }
    }

    pub fn commit(mut self) -> Result<KnobReport, PrepError> {
        self.close()
    }

    fn close(&mut self) -> Result<KnobReport, PrepError> {
        let Some(mut edit) = self.edit.take() else {
            return Ok(KnobReport::default());
        };
        let mut report = edit.finish()?;
        let mut touched: BTreeSet<String> = report.changes.iter().map(|c| c.name.clone()).collect();
        for deps in report.dependents.values() {
            touched.extend(deps.iter().cloned());
        }
        let knobs = edit.graph();
        for element in self.elements.iter_mut() {
            let ElementKind::Magnet(m) = &mut element.kind else {
                continue;
            };
            if !m.params().iter().any(|p| p.depends_on(&touched)) {
                continue;
            }
            for param in m.params_mut() {
                if let Some(expr) = &param.expr {
                    param.value = knobs.eval(expr).map_err(|source| LineError::Strength {
                        element: element.name.clone(),
                        source,
                    })?;
                }
            }
            report.affected_elements.push(element.name.clone());
        }
        Ok(report)
    }
}

impl Drop for LineEdit<'_> {
    fn drop(&mut self) {
        if self.edit.is_some() {
            if let Err(err) = self.close() {
                tracing::warn!(error = %err, "refreshing strengths after abandoned knob edit failed");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::knobs::Knob;

    pub(crate) fn magnet(name: &str, length: f64, k1l: Param) -> Element {
        Element {
            name: name.to_string(),
            keyword: "quadrupole".to_string(),
            length,
            kind: ElementKind::Magnet(Multipole {
                k1l,
                ..Multipole::default()
            }),
        }
    }

    fn sample() -> Line {
        let mut knobs = KnobGraph::new();
        knobs.define("kqf.b1", Knob::Expr(Expr::parse("0.02 + dqx.b1_op").unwrap())).unwrap();
        let elements = vec![
            Element::marker("ip1", "marker"),
            magnet("mq.1", 2.0, Param::deferred(Expr::parse("kqf.b1 * 2").unwrap(), 0.0)),
            Element::drift("drift_0", 3.0),
            Element::marker("bpm.1.b1", "monitor"),
            magnet("mq.2", 2.0, Param::literal(-0.04)),
        ];
        Line::new("lhcb1", elements, knobs).unwrap()
    }

    #[test]
    fn construction_evaluates_deferred_strengths() {
        let line = sample();
        let k = line.element("mq.1").unwrap().multipole().unwrap().k1l.value;
        assert!((k - 0.04).abs() < 1e-15);
        assert_eq!(line.s_positions(), vec![0.0, 0.0, 2.0, 5.0, 5.0]);
        assert!((line.length() - 7.0).abs() < 1e-15);
    }

    #[test]
    fn knob_edit_refreshes_affected_elements() {
        let mut line = sample();
        let mut edit = line.edit_knobs(["dqx.b1_op"]).unwrap();
        edit.set("dqx.b1_op", 0.01).unwrap();
        let report = edit.commit().unwrap();
        assert_eq!(report.affected_elements, vec!["mq.1".to_string()]);
        assert_eq!(report.dependents["dqx.b1_op"], vec!["kqf.b1".to_string()]);
        let k = line.element("mq.1").unwrap().multipole().unwrap().k1l.value;
        assert!((k - 0.06).abs() < 1e-15);
    }

    #[test]
    fn batch_insert_places_before_anchor() {
        let mut line = sample();
        let placements = vec![Placement {
            anchor: "bpm.1.b1".into(),
            s: 5.0,
            element: Element::monitor("bpm.1.b1_monitor", ParticleMonitor::new(0, 3, 1)),
        }];
        line.insert_batch(placements).unwrap();
        let names: Vec<_> = line.element_names().collect();
        assert_eq!(names, vec!["ip1", "mq.1", "drift_0", "bpm.1.b1_monitor", "bpm.1.b1", "mq.2"]);
    }

    #[test]
    fn batch_insert_rejects_wrong_position_and_duplicates() {
        let mut line = sample();
        let err = line
            .insert_batch(vec![Placement {
                anchor: "bpm.1.b1".into(),
                s: 4.0,
                element: Element::marker("m", "marker"),
            }])
            .unwrap_err();
        assert!(matches!(err, PrepError::Line(LineError::PositionMismatch { .. })));
        let err = line
            .insert_batch(vec![Placement {
                anchor: "mq.2".into(),
                s: 5.0,
                element: Element::marker("ip1", "marker"),
            }])
            .unwrap_err();
        assert!(matches!(err, PrepError::Line(LineError::DuplicateElement(_))));
        assert_eq!(line.len(), 5);
    }

    #[test]
    fn json_round_trip_keeps_expressions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("line.json");
        let mut line = sample();
        line.particle_ref = Some(ReferenceParticle::proton(6.8e12));
        line.to_json(&path).unwrap();
        let back = Line::from_json(&path).unwrap();
        assert_eq!(back.len(), line.len());
        assert_eq!(back.knobs(), line.knobs());
        assert_eq!(back.elements(), line.elements());
        assert_eq!(back.twiss_default.method, TwissMethod::FourD);
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"method\": \"4d\""));
    }

    #[test]
    fn monitor_records_inside_window_only() {
        let mut m = ParticleMonitor::new(2, 4, 1);
        m.record(0, 1, 9.0, 9.0);
        m.record(0, 2, 1.0, -1.0);
        m.record(0, 3, 2.0, -2.0);
        m.record(0, 4, 9.0, 9.0);
        assert_eq!(m.particle_x(0), &[1.0, 2.0]);
        assert_eq!(m.particle_y(0), &[-1.0, -2.0]);
    }
}
