//! Coupling-error injection followed by re-matching.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{BeamConfig, ConfigError};
use crate::knobs::{Knob, KnobError, KnobReport};
use crate::line::Line;
use crate::matching::{match_line, MatchReport, MatchSettings};
use crate::PrepError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorSettings {
    /// Knobs treated as independent and the values written to them.
    pub knobs: BTreeMap<String, f64>,
    /// Allows replacing knobs that are defined by an expression.
    pub allow_expression_override: bool,
}

impl Default for ErrorSettings {
    fn default() -> Self {
        Self {
            knobs: BTreeMap::from([("cmrs.b1".to_string(), 2e-4), ("cmis.b1".to_string(), 2e-4)]),
            allow_expression_override: false,
        }
    }
}

impl ErrorSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some((name, _)) = self.knobs.iter().find(|(_, v)| !v.is_finite()) {
            return Err(ConfigError::Invalid(format!("errors.knobs.{name} must be finite")));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub knobs: KnobReport,
    pub matching: MatchReport,
}

/// Writes the configured knob values through a declared edit. Fails without touching the line
/// when a knob is unknown, or defined by an expression and overrides are not allowed.
pub fn apply_knob_errors(line: &mut Line, settings: &ErrorSettings) -> Result<KnobReport, PrepError> {
    if !settings.allow_expression_override {
        for name in settings.knobs.keys() {
            let key = name.to_ascii_lowercase();
            if let Some(expr) = line.knobs().get(&key).and_then(Knob::expression) {
                return Err(KnobError::ExpressionOverride {
                    name: key,
                    expr: expr.to_string(),
                }
                .into());
            }
        }
    }
    let mut edit = line.edit_knobs(settings.knobs.keys())?;
    for (name, value) in &settings.knobs {
        if settings.allow_expression_override {
            edit.override_expression(name, *value)?;
        } else {
            edit.set(name, *value)?;
        }
    }
    let report = edit.commit()?;

    for change in &report.changes {
        if let Some(expr) = &change.replaced_expression {
            warn!(knob = %change.name, expression = %expr, "replaced expression by a literal");
        }
    }
    for (knob, dependents) in report.shared() {
        warn!(
            knob,
            dependents = %dependents.join(", "),
            "knob feeds other expressions; their values changed too"
        );
    }
    info!(
        knobs = report.changes.len(),
        elements = report.affected_elements.len(),
        "installed knob errors"
    );
    Ok(report)
}

/// Installs the errors and re-matches the tunes.
pub fn install_errors(
    config: &BeamConfig,
    line: &mut Line,
    settings: &ErrorSettings,
    matching: &MatchSettings,
) -> Result<ErrorReport, PrepError> {
    for name in settings.knobs.keys() {
        if line.knob_value(name).is_none() {
            return Err(KnobError::Unknown(name.clone()).into());
        }
    }
    let knobs = apply_knob_errors(line, settings)?;
    let matching = match_line(config, line, matching)?;
    Ok(ErrorReport { knobs, matching })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;
    use crate::knobs::KnobGraph;
    use crate::line::tests::magnet;
    use crate::line::{Element, Param};

    fn coupled_line() -> Line {
        let mut knobs = KnobGraph::new();
        knobs.define("cmrs.b1", Knob::Literal(0.0)).unwrap();
        knobs.define("cmis.b1", Knob::Literal(0.0)).unwrap();
        knobs
            .define("c_total", Knob::Expr(Expr::parse("cmrs.b1 + cmis.b1").unwrap()))
            .unwrap();
        let elements = vec![
            magnet("mqs.1", 0.3, Param::deferred(Expr::parse("10 * cmrs.b1").unwrap(), 0.0)),
            Element::drift("d", 1.0),
            magnet("mq.1", 0.3, Param::literal(0.01)),
        ];
        Line::new("ring", elements, knobs).unwrap()
    }

    #[test]
    fn reports_dependents_and_elements() {
        let mut line = coupled_line();
        let report = apply_knob_errors(&mut line, &ErrorSettings::default()).unwrap();
        assert_eq!(report.changes.len(), 2);
        assert_eq!(report.dependents["cmrs.b1"], vec!["c_total".to_string()]);
        assert_eq!(report.affected_elements, vec!["mqs.1".to_string()]);
        assert!((line.knob_value("c_total").unwrap() - 4e-4).abs() < 1e-18);
    }

    #[test]
    fn expression_knob_needs_override() {
        let mut line = coupled_line();
        let settings = ErrorSettings {
            knobs: BTreeMap::from([("c_total".to_string(), 1e-3)]),
            allow_expression_override: false,
        };
        let err = apply_knob_errors(&mut line, &settings).unwrap_err();
        assert!(matches!(err, PrepError::Knob(KnobError::ExpressionOverride { .. })));

        let settings = ErrorSettings {
            allow_expression_override: true,
            ..settings
        };
        let report = apply_knob_errors(&mut line, &settings).unwrap();
        assert_eq!(report.changes[0].replaced_expression.as_deref(), Some("cmrs.b1 + cmis.b1"));
        assert_eq!(line.knob_value("c_total"), Some(1e-3));
    }

    #[test]
    fn non_finite_values_are_rejected() {
        let settings = ErrorSettings {
            knobs: BTreeMap::from([("cmrs.b1".to_string(), f64::NAN)]),
            ..ErrorSettings::default()
        };
        assert!(settings.validate().is_err());
    }
}
