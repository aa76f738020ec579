//! Particle-monitor instrumentation of a line.

use regex::RegexBuilder;
use tracing::info;

use crate::line::{Element, Line, ParticleMonitor, Placement};
use crate::PrepError;

pub const DEFAULT_MONITOR_PATTERN: &str = "BPM.*B[12]$";
pub const MONITOR_SUFFIX: &str = "_monitor";

/// Inserts one monitor directly before every element whose name matches `pattern`
/// (case-insensitive). Returns the `(element, s, monitor)` placements in line order.
pub fn insert_monitors_at_pattern(
    line: &mut Line,
    pattern: &str,
    n_turns: usize,
    num_particles: usize,
) -> Result<Vec<(String, f64, String)>, PrepError> {
    let regex = RegexBuilder::new(pattern).case_insensitive(true).build()?;
    let selected = line.select(&regex);
    if selected.is_empty() {
        return Err(PrepError::Selection {
            pattern: pattern.to_string(),
        });
    }

    let template = ParticleMonitor::new(0, n_turns, num_particles);
    let placements: Vec<(String, f64, String)> = selected
        .into_iter()
        .map(|(name, s)| {
            let monitor = format!("{name}{MONITOR_SUFFIX}");
            (name, s, monitor)
        })
        .collect();
    line.insert_batch(
        placements
            .iter()
            .map(|(name, s, monitor)| Placement {
                anchor: name.clone(),
                s: *s,
                element: Element::monitor(monitor.clone(), template.clone()),
            })
            .collect(),
    )?;
    info!(pattern, monitors = placements.len(), n_turns, "inserted monitors");
    Ok(placements)
}

/// Element name observed by a monitor.
pub fn observed_element(monitor: &str) -> &str {
    monitor.strip_suffix(MONITOR_SUFFIX).unwrap_or(monitor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knobs::KnobGraph;

    fn line() -> Line {
        let elements = vec![
            Element::drift("d0", 1.0),
            Element::marker("bpm.1r1.b1", "monitor"),
            Element::drift("d1", 2.5),
            Element::marker("BPMWA.2R1.B1", "monitor"),
            Element::drift("d2", 1.0),
            Element::marker("bpm.3r1.b1_doros", "monitor"),
            Element::marker("mq.4r1.b1", "quadrupole"),
        ];
        Line::new("lhcb1", elements, KnobGraph::new()).unwrap()
    }

    #[test]
    fn monitors_land_before_matches() {
        let mut line = line();
        let before = line.len();
        let placed = insert_monitors_at_pattern(&mut line, DEFAULT_MONITOR_PATTERN, 4, 1).unwrap();
        assert_eq!(
            placed,
            vec![
                ("bpm.1r1.b1".to_string(), 1.0, "bpm.1r1.b1_monitor".to_string()),
                ("BPMWA.2R1.B1".to_string(), 3.5, "BPMWA.2R1.B1_monitor".to_string()),
            ]
        );
        assert_eq!(line.len(), before + 2);
        let names: Vec<&str> = line.element_names().collect();
        let at = names.iter().position(|n| *n == "bpm.1r1.b1_monitor").unwrap();
        assert_eq!(names[at + 1], "bpm.1r1.b1");
        let (_, monitor) = line.monitors().next().unwrap();
        assert_eq!(monitor.n_turns(), 4);
        assert_eq!(line.length(), 4.5);
    }

    #[test]
    fn zero_matches_name_the_pattern() {
        let mut line = line();
        match insert_monitors_at_pattern(&mut line, "^nothing$", 4, 1) {
            Err(PrepError::Selection { pattern }) => assert_eq!(pattern, "^nothing$"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn suffix_is_stripped() {
        assert_eq!(observed_element("bpm.1r1.b1_monitor"), "bpm.1r1.b1");
        assert_eq!(observed_element("ip1"), "ip1");
    }
}
