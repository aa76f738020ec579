//! Knob dependency graph.
//!
//! A knob is either a literal value or an expression over other knobs. Values are cached and
//! only recomputed for the knobs downstream of a change. Writing a literal and re-evaluating
//! its dependents are separate steps; callers outside the engine mutate knobs through a
//! [`KnobEdit`] that declares up front which knobs it treats as independent.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::expr::{Expr, ExprError};

#[derive(Debug, Error)]
pub enum KnobError {
    #[error("unknown knob `{0}`")]
    Unknown(String),
    #[error("knob `{0}` was not declared independent for this edit")]
    Undeclared(String),
    #[error("knob `{name}` is defined by the expression `{expr}`; use an explicit override to replace it")]
    ExpressionOverride { name: String, expr: String },
    #[error("defining `{name}` would create a dependency cycle through `{via}`")]
    Cycle { name: String, via: String },
    #[error("evaluating knob `{name}`: {source}")]
    Eval {
        name: String,
        #[source]
        source: ExprError,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Knob {
    Literal(f64),
    Expr(Expr),
}

impl Knob {
    pub fn expression(&self) -> Option<&Expr> {
        match self {
            Knob::Expr(expr) => Some(expr),
            Knob::Literal(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, Knob>", into = "BTreeMap<String, Knob>")]
pub struct KnobGraph {
    defs: BTreeMap<String, Knob>,
    values: BTreeMap<String, f64>,
}

impl TryFrom<BTreeMap<String, Knob>> for KnobGraph {
    type Error = KnobError;

    fn try_from(defs: BTreeMap<String, Knob>) -> Result<Self, Self::Error> {
        let mut graph = KnobGraph {
            defs,
            values: BTreeMap::new(),
        };
        graph.check_acyclic()?;
        graph.evaluate()?;
        Ok(graph)
    }
}

impl From<KnobGraph> for BTreeMap<String, Knob> {
    fn from(graph: KnobGraph) -> Self {
        graph.defs
    }
}

impl PartialEq for KnobGraph {
    fn eq(&self, other: &Self) -> bool {
        self.defs == other.defs
    }
}

impl KnobGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.defs.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Knob> {
        self.defs.get(name)
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.defs.keys().map(String::as_str)
    }

    /// Lookup closure suitable for [`Expr::eval`].
    pub fn lookup(&self) -> impl Fn(&str) -> Option<f64> + '_ {
        move |name: &str| self.values.get(name).copied()
    }

    pub fn eval(&self, expr: &Expr) -> Result<f64, ExprError> {
        expr.eval(&self.lookup())
    }

    /// Defines (or redefines) a knob and refreshes it and everything downstream.
    /// Unknown names referenced by an expression are created as literal zero.
    pub fn define(&mut self, name: &str, knob: Knob) -> Result<(), KnobError> {
        let name = name.to_ascii_lowercase();
        if let Knob::Expr(expr) = &knob {
            for var in expr.variables() {
                if var == name {
                    return Err(KnobError::Cycle {
                        name: name.clone(),
                        via: var,
                    });
                }
                if self.depends_on(&var, &name) {
                    return Err(KnobError::Cycle { name, via: var });
                }
            }
            for var in expr.variables() {
                if !self.defs.contains_key(&var) {
                    debug!(knob = %var, referenced_by = %name, "creating implicit zero knob");
                    self.defs.insert(var.clone(), Knob::Literal(0.0));
                    self.values.insert(var, 0.0);
                }
            }
        }
        self.defs.insert(name.clone(), knob);
        let mut stale = self.dependents(&name);
        stale.insert(0, name);
        self.recompute(&stale)
    }

    /// Writes a literal without touching dependents.
    pub(crate) fn write_literal(&mut self, name: &str, value: f64) {
        self.defs.insert(name.to_string(), Knob::Literal(value));
        self.values.insert(name.to_string(), value);
    }

    /// Recomputes the given knobs in the order given.
    pub fn recompute(&mut self, names: &[String]) -> Result<(), KnobError> {
        for name in names {
            let value = match self.defs.get(name) {
                Some(Knob::Literal(v)) => *v,
                Some(Knob::Expr(expr)) => self.eval(expr).map_err(|source| KnobError::Eval {
                    name: name.clone(),
                    source,
                })?,
                None => return Err(KnobError::Unknown(name.clone())),
            };
            self.values.insert(name.clone(), value);
        }
        Ok(())
    }

    /// Re-evaluates the whole graph in dependency order.
    pub fn evaluate(&mut self) -> Result<(), KnobError> {
        let order = self.topological_order();
        self.recompute(&order)
    }

    /// Knobs whose expressions reference `name`, directly or transitively, in evaluation order.
    pub fn dependents(&self, name: &str) -> Vec<String> {
        let mut reverse: BTreeMap<String, Vec<&str>> = BTreeMap::new();
        for (knob, def) in &self.defs {
            if let Knob::Expr(expr) = def {
                for var in expr.variables() {
                    reverse.entry(var).or_default().push(knob);
                }
            }
        }
        let mut reached = BTreeSet::new();
        let mut stack = vec![name.to_string()];
        while let Some(current) = stack.pop() {
            if let Some(users) = reverse.get(&current) {
                for user in users {
                    if reached.insert(user.to_string()) {
                        stack.push(user.to_string());
                    }
                }
            }
        }
        if reached.is_empty() {
            return Vec::new();
        }
        self.topological_order()
            .into_iter()
            .filter(|knob| reached.contains(knob))
            .collect()
    }

    fn depends_on(&self, name: &str, target: &str) -> bool {
        let mut seen = BTreeSet::new();
        let mut stack = vec![name.to_string()];
        while let Some(current) = stack.pop() {
            if current == target {
                return true;
            }
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(Knob::Expr(expr)) = self.defs.get(&current) {
                stack.extend(expr.variables());
            }
        }
        false
    }

    fn check_acyclic(&self) -> Result<(), KnobError> {
        for (name, def) in &self.defs {
            if let Knob::Expr(expr) = def {
                for var in expr.variables() {
                    if self.depends_on(&var, name) {
                        return Err(KnobError::Cycle {
                            name: name.clone(),
                            via: var,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn topological_order(&self) -> Vec<String> {
        fn visit<'g>(
            graph: &'g KnobGraph,
            name: &'g str,
            done: &mut BTreeSet<&'g str>,
            order: &mut Vec<String>,
        ) {
            if !done.insert(name) {
                return;
            }
            if let Some(Knob::Expr(expr)) = graph.defs.get(name) {
                for var in expr.variables() {
                    if let Some((key, _)) = graph.defs.get_key_value(var.as_str()) {
                        visit(graph, key, done, order);
                    }
                }
            }
            order.push(name.to_string());
        }

        let mut done = BTreeSet::new();
        let mut order = Vec::with_capacity(self.defs.len());
        for name in self.defs.keys() {
            visit(self, name, &mut done, &mut order);
        }
        order
    }

    /// Opens an edit that may only write the declared knobs.
    pub fn edit<I, S>(&mut self, independent: I) -> Result<KnobEdit<'_>, KnobError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut declared = BTreeSet::new();
        for name in independent {
            let name = name.as_ref().to_ascii_lowercase();
            if !self.defs.contains_key(&name) {
                return Err(KnobError::Unknown(name));
            }
            declared.insert(name);
        }
        Ok(KnobEdit {
            graph: self,
            declared,
            changes: BTreeMap::new(),
            finished: false,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnobChange {
    pub name: String,
    pub before: f64,
    pub after: f64,
    /// Expression that was replaced by an explicit override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaced_expression: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnobReport {
    pub changes: Vec<KnobChange>,
    /// For each written knob, the expression knobs downstream of it.
    pub dependents: BTreeMap<String, Vec<String>>,
    /// Elements whose strengths were refreshed.
    pub affected_elements: Vec<String>,
}

impl KnobReport {
    /// Written knobs that feed at least one other knob expression.
    pub fn shared(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.dependents
            .iter()
            .filter(|(_, deps)| !deps.is_empty())
            .map(|(name, deps)| (name.as_str(), deps.as_slice()))
    }
}

/// Declared knob edit. Dropping an unfinished edit still re-evaluates dependents.
#[derive(Debug)]
pub struct KnobEdit<'g> {
    graph: &'g mut KnobGraph,
    declared: BTreeSet<String>,
    changes: BTreeMap<String, KnobChange>,
    finished: bool,
}

impl<'g> KnobEdit<'g> {
    pub fn graph(&self) -> &KnobGraph {
        &*self.graph
    }

    pub fn set(&mut self, name: &str, value: f64) -> Result<(), KnobError> {
        let name = self.check_declared(name)?;
        if let Some(Knob::Expr(expr)) = self.graph.defs.get(&name) {
            return Err(KnobError::ExpressionOverride {
                name,
                expr: expr.to_string(),
            });
        }
        self.write(name, value, None);
        Ok(())
    }

    /// Replaces an expression-defined knob by a literal.
    pub fn override_expression(&mut self, name: &str, value: f64) -> Result<(), KnobError> {
        let name = self.check_declared(name)?;
        let replaced = self
            .graph
            .defs
            .get(&name)
            .and_then(Knob::expression)
            .map(Expr::to_string);
        self.write(name, value, replaced);
        Ok(())
    }

    fn check_declared(&self, name: &str) -> Result<String, KnobError> {
        let name = name.to_ascii_lowercase();
        if self.declared.contains(&name) {
            Ok(name)
        } else {
            Err(KnobError::Undeclared(name))
        }
    }

    fn write(&mut self, name: String, value: f64, replaced_expression: Option<String>) {
        let before = self.graph.value(&name).unwrap_or(0.0);
        self.graph.write_literal(&name, value);
        let change = self
            .changes
            .entry(name.clone())
            .or_insert_with(|| KnobChange {
                name,
                before,
                after: value,
                replaced_expression: None,
            });
        change.after = value;
        if replaced_expression.is_some() {
            change.replaced_expression = replaced_expression;
        }
    }

    /// Re-evaluates every knob downstream of the written ones.
    pub fn commit(mut self) -> Result<KnobReport, KnobError> {
        self.finish()
    }

    pub(crate) fn finish(&mut self) -> Result<KnobReport, KnobError> {
        self.finished = true;
        let mut report = KnobReport::default();
        let mut stale = BTreeSet::new();
        for name in self.changes.keys() {
            let deps = self.graph.dependents(name);
            stale.extend(deps.iter().cloned());
            report.dependents.insert(name.clone(), deps);
        }
        let order: Vec<String> = self
            .graph
            .topological_order()
            .into_iter()
            .filter(|name| stale.contains(name))
            .collect();
        self.graph.recompute(&order)?;
        report.changes = std::mem::take(&mut self.changes).into_values().collect();
        Ok(report)
    }
}

impl Drop for KnobEdit<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(err) = self.finish() {
                tracing::warn!(error = %err, "re-evaluating knobs after abandoned edit failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expr(text: &str) -> Knob {
        Knob::Expr(Expr::parse(text).unwrap())
    }

    fn sample() -> KnobGraph {
        let mut g = KnobGraph::new();
        g.define("kqf0.b1", Knob::Literal(0.01)).unwrap();
        g.define("kqf.b1", expr("kqf0.b1 + 0.1 * dqx.b1_op")).unwrap();
        g.define("k1s.a", expr("10 * cmrs.b1")).unwrap();
        g.define("k1s.b", expr("k1s.a + cmis.b1")).unwrap();
        g
    }

    #[test]
    fn implicit_knobs_start_at_zero() {
        let g = sample();
        assert_eq!(g.value("dqx.b1_op"), Some(0.0));
        assert!((g.value("kqf.b1").unwrap() - 0.01).abs() < 1e-15);
    }

    #[test]
    fn redefinition_refreshes_dependents() {
        let mut g = sample();
        g.define("dqx.b1_op", Knob::Literal(2.0)).unwrap();
        assert!((g.value("kqf.b1").unwrap() - 0.21).abs() < 1e-15);
    }

    #[test]
    fn cycles_are_refused() {
        let mut g = sample();
        let err = g.define("cmrs.b1", expr("k1s.b * 2")).unwrap_err();
        assert!(matches!(err, KnobError::Cycle { .. }));
        let err = g.define("x", expr("x + 1")).unwrap_err();
        assert!(matches!(err, KnobError::Cycle { .. }));
    }

    #[test]
    fn dependents_are_transitive_and_ordered() {
        let g = sample();
        assert_eq!(g.dependents("cmrs.b1"), vec!["k1s.a".to_string(), "k1s.b".to_string()]);
        assert!(g.dependents("kqf.b1").is_empty());
    }

    #[test]
    fn edit_refuses_undeclared_and_expression_knobs() {
        let mut g = sample();
        let mut edit = g.edit(["cmrs.b1", "kqf.b1"]).unwrap();
        assert!(matches!(edit.set("cmis.b1", 1.0), Err(KnobError::Undeclared(_))));
        assert!(matches!(
            edit.set("kqf.b1", 1.0),
            Err(KnobError::ExpressionOverride { .. })
        ));
        edit.set("cmrs.b1", 2e-4).unwrap();
        let report = edit.commit().unwrap();
        assert_eq!(report.changes.len(), 1);
        assert_eq!(report.dependents["cmrs.b1"], vec!["k1s.a", "k1s.b"]);
        assert!((g.value("k1s.b").unwrap() - 2e-3).abs() < 1e-15);
    }

    #[test]
    fn explicit_override_replaces_expression() {
        let mut g = sample();
        let mut edit = g.edit(["kqf.b1"]).unwrap();
        edit.override_expression("kqf.b1", 0.5).unwrap();
        let report = edit.commit().unwrap();
        assert_eq!(
            report.changes[0].replaced_expression.as_deref(),
            Some("kqf0.b1 + 0.1 * dqx.b1_op")
        );
        assert_eq!(g.get("kqf.b1"), Some(&Knob::Literal(0.5)));
    }

    #[test]
    fn edit_of_unknown_knob_fails() {
        let mut g = sample();
        assert!(matches!(g.edit(["nope"]), Err(KnobError::Unknown(_))));
    }

    #[test]
    fn dropped_edit_still_refreshes() {
        let mut g = sample();
        {
            let mut edit = g.edit(["cmrs.b1"]).unwrap();
            edit.set("cmrs.b1", 1.0).unwrap();
        }
        assert!((g.value("k1s.a").unwrap() - 10.0).abs() < 1e-15);
    }

    #[test]
    fn serde_restores_values() {
        let mut g = sample();
        g.define("dqx.b1_op", Knob::Literal(1.0)).unwrap();
        let json = serde_json::to_string(&g).unwrap();
        let back: KnobGraph = serde_json::from_str(&json).unwrap();
        assert_eq!(back, g);
        assert_eq!(back.value("kqf.b1"), g.value("kqf.b1"));
    }
}
