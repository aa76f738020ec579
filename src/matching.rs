//! Tune and chromaticity matching through the operational knobs.
//!
//! The search is a damped Newton iteration on a forward-difference Jacobian, solved in the
//! least-squares sense. It is reached through the [`Solver`] trait so a different search can
//! be plugged in.

use std::fmt;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{BeamConfig, ConfigError};
use crate::knobs::KnobError;
use crate::line::Line;
use crate::logging;
use crate::optics::{twiss, TwissOptions};
use crate::PrepError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergencePolicy {
    /// Log a warning and keep the best point found.
    #[default]
    Warn,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchSettings {
    /// Finite-difference step of every varied knob.
    pub step: f64,
    pub tolerance: f64,
    pub chroma: bool,
    pub max_iterations: usize,
    pub on_non_convergence: ConvergencePolicy,
}

impl Default for MatchSettings {
    fn default() -> Self {
        Self {
            step: 1e-8,
            tolerance: 1e-10,
            chroma: false,
            max_iterations: 30,
            on_non_convergence: ConvergencePolicy::Warn,
        }
    }
}

impl MatchSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.step.is_finite() && self.step > 0.0) {
            return Err(ConfigError::Invalid("matching.step must be positive".to_string()));
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(ConfigError::Invalid(
                "matching.tolerance must be positive".to_string(),
            ));
        }
        if self.max_iterations == 0 {
            return Err(ConfigError::Invalid(
                "matching.max_iterations must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantity {
    Qx,
    Qy,
    Dqx,
    Dqy,
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Quantity::Qx => "qx",
            Quantity::Qy => "qy",
            Quantity::Dqx => "dqx",
            Quantity::Dqy => "dqy",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Vary {
    pub name: String,
    pub step: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Target {
    pub quantity: Quantity,
    pub value: f64,
    pub tol: f64,
}

/// Maps knob values to achieved target quantities.
pub trait Objective {
    fn evaluate(&mut self, values: &[f64]) -> Result<Vec<f64>, PrepError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    pub values: Vec<f64>,
    pub achieved: Vec<f64>,
    pub converged: bool,
    pub iterations: usize,
}

pub trait Solver {
    /// Searches from `start`. On return the objective was last evaluated at the solution.
    fn solve(
        &self,
        vary: &[Vary],
        start: &[f64],
        targets: &[Target],
        objective: &mut dyn Objective,
    ) -> Result<Solution, PrepError>;
}

pub struct JacobianSolver {
    pub max_iterations: usize,
    pub max_halvings: usize,
}

impl Default for JacobianSolver {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            max_halvings: 12,
        }
    }
}

fn residual_norm(achieved: &[f64], targets: &[Target]) -> f64 {
    achieved
        .iter()
        .zip(targets)
        .map(|(a, t)| ((a - t.value) / t.tol).powi(2))
        .sum::<f64>()
        .sqrt()
}

fn within_tolerance(achieved: &[f64], targets: &[Target]) -> bool {
    achieved
        .iter()
        .zip(targets)
        .all(|(a, t)| (a - t.value).abs() <= t.tol)
}

impl Solver for JacobianSolver {
    fn solve(
        &self,
        vary: &[Vary],
        start: &[f64],
        targets: &[Target],
        objective: &mut dyn Objective,
    ) -> Result<Solution, PrepError> {
        let mut x = start.to_vec();
        let mut f = objective.evaluate(&x)?;
        let mut norm = residual_norm(&f, targets);
        let mut iterations = 0;
        let mut converged = within_tolerance(&f, targets);

        while !converged && iterations < self.max_iterations {
            iterations += 1;
            let mut jacobian = DMatrix::<f64>::zeros(targets.len(), vary.len());
            for (j, v) in vary.iter().enumerate() {
                let mut probe = x.clone();
                probe[j] += v.step;
                let fp = objective.evaluate(&probe)?;
                for i in 0..targets.len() {
                    jacobian[(i, j)] = (fp[i] - f[i]) / v.step;
                }
            }
            let residual = DVector::from_iterator(
                targets.len(),
                f.iter().zip(targets).map(|(a, t)| t.value - a),
            );
            let dx = jacobian
                .svd(true, true)
                .solve(&residual, 1e-14)
                .map_err(|err| PrepError::Solver(err.to_string()))?;

            let mut lambda = 1.0;
            let mut accepted = false;
            for _ in 0..=self.max_halvings {
                let trial: Vec<f64> = x.iter().zip(dx.iter()).map(|(xi, di)| xi + lambda * di).collect();
                match objective.evaluate(&trial) {
                    Ok(ft) if residual_norm(&ft, targets) < norm => {
                        x = trial;
                        f = ft;
                        norm = residual_norm(&f, targets);
                        accepted = true;
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => debug!(error = %err, lambda, "trial step rejected"),
                }
                lambda /= 2.0;
            }
            debug!(iteration = iterations, norm, accepted, "newton step");
            converged = within_tolerance(&f, targets);
            if !accepted {
                break;
            }
        }

        // leave the objective at the returned point
        let achieved = objective.evaluate(&x)?;
        Ok(Solution {
            values: x,
            achieved,
            converged,
            iterations,
        })
    }
}

/// Applies knob values to a line and reports tunes and chromaticities.
struct LineObjective<'a> {
    line: &'a mut Line,
    knobs: &'a [String],
    quantities: Vec<Quantity>,
}

impl Objective for LineObjective<'_> {
    fn evaluate(&mut self, values: &[f64]) -> Result<Vec<f64>, PrepError> {
        let mut edit = self.line.edit_knobs(self.knobs)?;
        for (name, value) in self.knobs.iter().zip(values) {
            edit.set(name, *value)?;
        }
        edit.commit()?;
        let chromaticity = self
            .quantities
            .iter()
            .any(|q| matches!(q, Quantity::Dqx | Quantity::Dqy));
        let tw = twiss(
            self.line,
            &TwissOptions {
                strengths: false,
                chromaticity,
            },
        )?;
        Ok(self
            .quantities
            .iter()
            .map(|q| match q {
                Quantity::Qx => tw.qx,
                Quantity::Qy => tw.qy,
                Quantity::Dqx => tw.dqx.unwrap_or(f64::NAN),
                Quantity::Dqy => tw.dqy.unwrap_or(f64::NAN),
            })
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetReport {
    pub quantity: Quantity,
    pub target: f64,
    pub achieved: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchReport {
    pub knobs: Vec<(String, f64)>,
    pub targets: Vec<TargetReport>,
    pub converged: bool,
    pub iterations: usize,
}

impl MatchReport {
    pub fn achieved(&self, quantity: Quantity) -> Option<f64> {
        self.targets
            .iter()
            .find(|t| t.quantity == quantity)
            .map(|t| t.achieved)
    }
}

/// Beam index used in knob names. Beam 4 is beam 2 described in the beam-1 orientation and
/// carries the beam-2 knobs.
pub fn knob_beam(beam: u8) -> u8 {
    match beam {
        4 => 2,
        beam => beam,
    }
}

/// Operational knob names varied for `beam`.
pub fn tune_knobs(beam: u8) -> [String; 2] {
    [format!("dqx.b{beam}_op"), format!("dqy.b{beam}_op")]
}

pub fn chroma_knobs(beam: u8) -> [String; 2] {
    [format!("dqpx.b{beam}_op"), format!("dqpy.b{beam}_op")]
}

/// Matches the configured tunes (and chromaticity when enabled) with the default solver.
pub fn match_line(config: &BeamConfig, line: &mut Line, settings: &MatchSettings) -> Result<MatchReport, PrepError> {
    let solver = JacobianSolver {
        max_iterations: settings.max_iterations,
        ..JacobianSolver::default()
    };
    match_with(&solver, config, line, settings)
}

pub fn match_with(
    solver: &dyn Solver,
    config: &BeamConfig,
    line: &mut Line,
    settings: &MatchSettings,
) -> Result<MatchReport, PrepError> {
    let beam = knob_beam(config.beam());
    let [qx, qy] = config.nat_tunes();
    let mut knobs: Vec<String> = tune_knobs(beam).into();
    let mut targets = vec![
        Target {
            quantity: Quantity::Qx,
            value: qx,
            tol: settings.tolerance,
        },
        Target {
            quantity: Quantity::Qy,
            value: qy,
            tol: settings.tolerance,
        },
    ];
    if settings.chroma {
        knobs.extend(chroma_knobs(beam));
        for quantity in [Quantity::Dqx, Quantity::Dqy] {
            targets.push(Target {
                quantity,
                value: config.chroma(),
                tol: settings.tolerance,
            });
        }
    }

    let start = knobs
        .iter()
        .map(|k| {
            line.knob_value(k)
                .ok_or_else(|| PrepError::Knob(KnobError::Unknown(k.clone())))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let vary: Vec<Vary> = knobs
        .iter()
        .map(|name| Vary {
            name: name.clone(),
            step: settings.step,
        })
        .collect();

    let solution = {
        let _quiet = logging::quiet();
        let mut objective = LineObjective {
            line: &mut *line,
            knobs: &knobs,
            quantities: targets.iter().map(|t| t.quantity).collect(),
        };
        solver.solve(&vary, &start, &targets, &mut objective)?
    };

    let report = MatchReport {
        knobs: knobs.iter().cloned().zip(solution.values.iter().copied()).collect(),
        targets: targets
            .iter()
            .zip(&solution.achieved)
            .map(|(t, a)| TargetReport {
                quantity: t.quantity,
                target: t.value,
                achieved: *a,
            })
            .collect(),
        converged: solution.converged,
        iterations: solution.iterations,
    };

    if report.converged {
        info!(
            line = %line.name,
            iterations = report.iterations,
            qx = solution.achieved[0],
            qy = solution.achieved[1],
            "matching converged"
        );
        return Ok(report);
    }
    match settings.on_non_convergence {
        ConvergencePolicy::Warn => {
            for t in &report.targets {
                warn!(quantity = %t.quantity, target = t.target, achieved = t.achieved, "target not reached");
            }
            warn!(line = %line.name, iterations = report.iterations, "matching did not converge; keeping best point");
            Ok(report)
        }
        ConvergencePolicy::Fail => Err(PrepError::MatchNotConverged {
            iterations: report.iterations,
            detail: report
                .targets
                .iter()
                .map(|t| format!("{} = {} (target {})", t.quantity, t.achieved, t.target))
                .collect::<Vec<_>>()
                .join(", "),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Linear objective `A x + b`.
    struct Linear {
        a: [[f64; 2]; 2],
        b: [f64; 2],
        calls: usize,
    }

    impl Objective for Linear {
        fn evaluate(&mut self, x: &[f64]) -> Result<Vec<f64>, PrepError> {
            self.calls += 1;
            Ok((0..2)
                .map(|i| self.a[i][0] * x[0] + self.a[i][1] * x[1] + self.b[i])
                .collect())
        }
    }

    fn targets(tol: f64) -> Vec<Target> {
        vec![
            Target {
                quantity: Quantity::Qx,
                value: 0.28,
                tol,
            },
            Target {
                quantity: Quantity::Qy,
                value: 0.31,
                tol,
            },
        ]
    }

    fn vary() -> Vec<Vary> {
        ["a", "b"]
            .iter()
            .map(|n| Vary {
                name: n.to_string(),
                step: 1e-8,
            })
            .collect()
    }

    #[test]
    fn solves_linear_system() {
        let mut objective = Linear {
            a: [[1.0, 0.2], [-0.1, 0.8]],
            b: [0.25, 0.3],
            calls: 0,
        };
        let solution = JacobianSolver::default()
            .solve(&vary(), &[0.0, 0.0], &targets(1e-10), &mut objective)
            .unwrap();
        assert!(solution.converged);
        assert!((solution.achieved[0] - 0.28).abs() <= 1e-10);
        assert!((solution.achieved[1] - 0.31).abs() <= 1e-10);
    }

    #[test]
    fn already_matched_start_does_not_iterate() {
        let mut objective = Linear {
            a: [[1.0, 0.0], [0.0, 1.0]],
            b: [0.28, 0.31],
            calls: 0,
        };
        let solution = JacobianSolver::default()
            .solve(&vary(), &[0.0, 0.0], &targets(1e-10), &mut objective)
            .unwrap();
        assert!(solution.converged);
        assert_eq!(solution.iterations, 0);
        assert_eq!(solution.values, vec![0.0, 0.0]);
    }

    #[test]
    fn unreachable_target_is_not_converged() {
        // both outputs respond to the same combination only
        let mut objective = Linear {
            a: [[1.0, 1.0], [1.0, 1.0]],
            b: [0.0, 0.0],
            calls: 0,
        };
        let solution = JacobianSolver {
            max_iterations: 5,
            max_halvings: 4,
        }
        .solve(&vary(), &[0.0, 0.0], &targets(1e-10), &mut objective)
        .unwrap();
        assert!(!solution.converged);
        assert!(solution.iterations <= 5);
    }

    #[test]
    fn settings_validation() {
        assert!(MatchSettings::default().validate().is_ok());
        let bad = MatchSettings {
            step: 0.0,
            ..MatchSettings::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn beam_four_uses_beam_two_knobs() {
        assert_eq!(tune_knobs(knob_beam(4)), ["dqx.b2_op", "dqy.b2_op"]);
        assert_eq!(chroma_knobs(knob_beam(4)), ["dqpx.b2_op", "dqpy.b2_op"]);
        assert_eq!(tune_knobs(knob_beam(1)), ["dqx.b1_op", "dqy.b1_op"]);
        assert_eq!(knob_beam(2), 2);
    }
}
