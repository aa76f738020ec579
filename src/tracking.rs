//! Thin-lens multi-turn tracking and the turn-by-turn driver.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::artifacts::Stage;
use crate::config::{BeamConfig, ConfigError};
use crate::line::{ElementKind, Line, Multipole};
use crate::monitors::{insert_monitors_at_pattern, DEFAULT_MONITOR_PATTERN};
use crate::optics::{twiss, TwissOptions};
use crate::tbt::{tbt_path, TbtData};
use crate::PrepError;

/// Transverse amplitude beyond which a particle is considered lost [m].
pub const APERTURE: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingSettings {
    pub n_turns: usize,
    /// Action 2J [m], used in both planes.
    pub action: f64,
    pub output_name: String,
    pub monitor_pattern: String,
    /// Stage loaded when no line is handed over.
    pub source: Stage,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            n_turns: 10,
            action: 3e-9,
            output_name: "tracked".to_string(),
            monitor_pattern: DEFAULT_MONITOR_PATTERN.to_string(),
            source: Stage::WithErrors,
        }
    }
}

impl TrackingSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_turns == 0 {
            return Err(ConfigError::Invalid("tracking.n_turns must be positive".to_string()));
        }
        if !(self.action.is_finite() && self.action >= 0.0) {
            return Err(ConfigError::Invalid(
                "tracking.action must be finite and non-negative".to_string(),
            ));
        }
        if self.output_name.trim().is_empty() {
            return Err(ConfigError::Invalid("tracking.output_name must be set".to_string()));
        }
        if !self.source.is_persisted() {
            return Err(ConfigError::Invalid(format!(
                "tracking.source must be a persisted stage, got {}",
                self.source
            )));
        }
        Ok(())
    }
}

/// Phase-space coordinates of a set of particles.
#[derive(Debug, Clone, PartialEq)]
pub struct Particles {
    pub x: Vec<f64>,
    pub px: Vec<f64>,
    pub y: Vec<f64>,
    pub py: Vec<f64>,
    pub delta: Vec<f64>,
    /// Turn at which each particle left the aperture.
    pub lost_at_turn: Vec<Option<usize>>,
}

impl Particles {
    /// On-momentum particles at the given offsets with zero angles.
    pub fn at_offsets(x: &[f64], y: &[f64]) -> Self {
        let n = x.len().min(y.len());
        Self {
            x: x[..n].to_vec(),
            px: vec![0.0; n],
            y: y[..n].to_vec(),
            py: vec![0.0; n],
            delta: vec![0.0; n],
            lost_at_turn: vec![None; n],
        }
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    pub fn n_lost(&self) -> usize {
        self.lost_at_turn.iter().filter(|l| l.is_some()).count()
    }

    fn drift(&mut self, i: usize, l: f64) {
        self.x[i] += self.px[i] * l;
        self.y[i] += self.py[i] * l;
    }

    fn kick(&mut self, i: usize, m: &Multipole) {
        let (x, y) = (self.x[i], self.y[i]);
        let (k0l, k1l, k1sl, k2l) = (m.k0l.value, m.k1l.value, m.k1sl.value, m.k2l.value);
        self.px[i] += -k1l * x + k1sl * y - 0.5 * k2l * (x * x - y * y) + k0l * self.delta[i];
        self.py[i] += k1l * y + k1sl * x + k2l * x * y;
    }
}

/// Tracks `particles` for `turns` turns, recording at every monitor.
pub fn track(line: &mut Line, particles: &mut Particles, turns: usize) {
    for turn in 0..turns {
        for element in line.elements_mut() {
            let l = element.length;
            for i in 0..particles.len() {
                if particles.lost_at_turn[i].is_some() {
                    continue;
                }
                match &mut element.kind {
                    ElementKind::Magnet(m) => {
                        particles.drift(i, l / 2.0);
                        particles.kick(i, m);
                        particles.drift(i, l / 2.0);
                    }
                    ElementKind::Monitor(monitor) => {
                        monitor.record(i, turn, particles.x[i], particles.y[i]);
                        particles.drift(i, l);
                    }
                    ElementKind::Drift | ElementKind::Marker => particles.drift(i, l),
                }
                let (x, y) = (particles.x[i], particles.y[i]);
                if !(x.abs() < APERTURE && y.abs() < APERTURE) {
                    debug!(particle = i, turn, element = %element.name, "particle lost");
                    particles.lost_at_turn[i] = Some(turn);
                }
            }
        }
    }
}

/// Instruments `line` with monitors, tracks one particle at the configured action and writes the
/// turn-by-turn record.
pub fn create_turn_by_turn_data(
    config: &BeamConfig,
    mut line: Line,
    settings: &TrackingSettings,
) -> Result<TbtData, PrepError> {
    insert_monitors_at_pattern(&mut line, &settings.monitor_pattern, settings.n_turns, 1)?;

    let tw = twiss(
        &line,
        &TwissOptions {
            strengths: true,
            chromaticity: false,
        },
    )?;
    let (betx, bety) = tw
        .rows
        .first()
        .map(|r| (r.betx, r.bety))
        .ok_or_else(|| PrepError::FormatAdaptation("optics table has no rows".to_string()))?;
    if line.has_skew_components() {
        warn!("line has skew strengths; offsets from the uncoupled action are approximate");
    }
    let x0 = (settings.action * betx).sqrt();
    let y0 = (settings.action * bety).sqrt();

    let mut particles = Particles::at_offsets(&[x0], &[y0]);
    info!(n_turns = settings.n_turns, x0, y0, "tracking");
    track(&mut line, &mut particles, settings.n_turns);
    if let Some(turn) = particles.lost_at_turn[0] {
        warn!(turn, "particle lost; later samples are zero");
    }

    let data = TbtData::from_monitors(&line)?;
    data.write(&tbt_path(config, &settings.output_name))?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line::{Element, ParticleMonitor, Placement};
    use crate::optics::tests::fodo_ring;

    fn ring_with_monitor(turns: usize) -> Line {
        let cell = 40.0;
        let k1l = 4.0 * (90f64.to_radians() / 2.0).sin() / cell;
        let mut line = fodo_ring(7, cell, k1l, 0.0);
        let s = line.select(&regex::Regex::new("^bpm\\.0$").unwrap())[0].1;
        line.insert_batch(vec![Placement {
            anchor: "bpm.0".into(),
            s,
            element: Element::monitor("bpm.0_monitor", ParticleMonitor::new(0, turns, 1)),
        }])
        .unwrap();
        line
    }

    #[test]
    fn zero_action_stays_on_axis() {
        let mut line = ring_with_monitor(20);
        let mut particles = Particles::at_offsets(&[0.0], &[0.0]);
        track(&mut line, &mut particles, 20);
        let (_, monitor) = line.monitors().next().unwrap();
        assert!(monitor.particle_x(0).iter().all(|v| *v == 0.0));
        assert!(monitor.particle_y(0).iter().all(|v| *v == 0.0));
    }

    #[test]
    fn linear_motion_keeps_the_invariant() {
        let turns = 8;
        let mut line = ring_with_monitor(turns);
        let tw = twiss(&line, &TwissOptions::default()).unwrap();
        let (beta0, alfa0) = (tw.rows[0].betx, tw.rows[0].alfx);
        let beta_mon = tw.row("bpm.0_monitor").unwrap().betx;

        let x0 = 1e-3;
        let mut particles = Particles::at_offsets(&[x0], &[0.0]);
        track(&mut line, &mut particles, turns);

        // 2J = gamma x^2 with zero angle; |x| at the monitor is bounded by sqrt(2J beta)
        let two_j = (1.0 + alfa0 * alfa0) / beta0 * x0 * x0;
        let amplitude = (two_j * beta_mon).sqrt();
        let (_, monitor) = line.monitors().next().unwrap();
        let xs = monitor.particle_x(0);
        assert!(xs.iter().all(|x| x.abs() <= amplitude * (1.0 + 1e-9)));
        let largest = xs.iter().fold(0.0f64, |m, x| m.max(x.abs()));
        assert!(largest >= 0.7 * amplitude);
        assert_eq!(particles.n_lost(), 0);
    }

    #[test]
    fn large_offsets_are_lost() {
        let mut line = ring_with_monitor(5);
        let mut particles = Particles::at_offsets(&[2.0], &[0.0]);
        track(&mut line, &mut particles, 5);
        assert_eq!(particles.lost_at_turn[0], Some(0));
    }

    #[test]
    fn settings_validation() {
        assert!(TrackingSettings::default().validate().is_ok());
        let bad = TrackingSettings {
            source: Stage::WithMonitors,
            ..TrackingSettings::default()
        };
        assert!(bad.validate().is_err());
    }
}
