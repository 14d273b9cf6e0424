//! Zero-crossing detection for event functions.
//!
//! Both backends report crossings the same way: each event is evaluated at
//! every output sample and every adjacent pair `(i, i + 1)` whose sign
//! product is non-positive is recorded. Crossings are not root-refined.

use crate::traits::EventFunction;
use serde::{Deserialize, Serialize};

/// Crossings reported for one trajectory, one entry per event function.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventLog {
    /// Sample index pairs bracketing a sign change or exact zero.
    pub intervals: Vec<Vec<(usize, usize)>>,
    /// Interpolated crossing times seen between internal solver steps.
    /// Advisory only; empty for backends that do not step internally.
    pub native_times: Vec<Vec<f64>>,
}

impl EventLog {
    pub fn is_empty(&self) -> bool {
        self.intervals.iter().all(Vec::is_empty) && self.native_times.iter().all(Vec::is_empty)
    }
}

/// Sign with `sign(0) = 0`. NaN stays NaN so it never compares as a crossing.
fn sign(value: f64) -> f64 {
    if value > 0.0 {
        1.0
    } else if value < 0.0 {
        -1.0
    } else if value == 0.0 {
        0.0
    } else {
        f64::NAN
    }
}

/// Adjacent index pairs where `sign(v[i]) * sign(v[i+1]) <= 0`.
pub fn sign_change_intervals(values: &[f64]) -> Vec<(usize, usize)> {
    values
        .windows(2)
        .enumerate()
        .filter(|(_, pair)| sign(pair[0]) * sign(pair[1]) <= 0.0)
        .map(|(i, _)| (i, i + 1))
        .collect()
}

/// Evaluates every event on the sampled trajectory.
pub fn detect_on_grid(
    events: &[&dyn EventFunction],
    times: &[f64],
    states: &[Vec<f64>],
) -> EventLog {
    let intervals = events
        .iter()
        .map(|event| {
            let values: Vec<f64> = times
                .iter()
                .zip(states)
                .map(|(&t, y)| event.evaluate(t, y))
                .collect();
            sign_change_intervals(&values)
        })
        .collect();
    EventLog {
        intervals,
        native_times: vec![Vec::new(); events.len()],
    }
}

/// Watches event values across accepted internal steps of an adaptive
/// solver and records where each one crosses zero.
pub(crate) struct CrossingTracker<'a> {
    events: &'a [&'a dyn EventFunction],
    previous: Vec<f64>,
    times: Vec<Vec<f64>>,
}

impl<'a> CrossingTracker<'a> {
    pub fn new(events: &'a [&'a dyn EventFunction], t0: f64, y0: &[f64]) -> Self {
        Self {
            events,
            previous: events.iter().map(|e| e.evaluate(t0, y0)).collect(),
            times: vec![Vec::new(); events.len()],
        }
    }

    /// Records crossings inside `(t_old, t_new]`, locating them by linear
    /// interpolation of the event value.
    pub fn observe(&mut self, t_old: f64, t_new: f64, y_new: &[f64]) {
        for (k, event) in self.events.iter().enumerate() {
            let g_old = self.previous[k];
            let g_new = event.evaluate(t_new, y_new);
            if g_new == 0.0 {
                self.times[k].push(t_new);
            } else if g_old * g_new < 0.0 {
                let fraction = g_old / (g_old - g_new);
                self.times[k].push(t_old + fraction * (t_new - t_old));
            }
            self.previous[k] = g_new;
        }
    }

    pub fn into_times(self) -> Vec<Vec<f64>> {
        self.times
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_treats_zero_as_zero() {
        assert_eq!(sign(0.0), 0.0);
        assert_eq!(sign(-0.0), 0.0);
        assert_eq!(sign(3.0), 1.0);
        assert!(sign(f64::NAN).is_nan());
    }

    #[test]
    fn intervals_include_exact_zeros_and_sign_changes() {
        let values = [1.0, 0.5, -0.5, -1.0, 0.0, 2.0];
        assert_eq!(
            sign_change_intervals(&values),
            vec![(1, 2), (3, 4), (4, 5)]
        );
        assert!(sign_change_intervals(&[1.0]).is_empty());
        assert!(sign_change_intervals(&[1.0, f64::NAN, 1.0]).is_empty());
    }

    #[test]
    fn grid_detection_uses_event_order() {
        let times = [0.0, 1.0, 2.0, 3.0];
        let states: Vec<Vec<f64>> = times.iter().map(|&t| vec![t]).collect();
        let crosses_at_one_and_a_half = |_t: f64, y: &[f64]| y[0] - 1.5;
        let never = |_t: f64, _y: &[f64]| 1.0;
        let events: [&dyn EventFunction; 2] = [&crosses_at_one_and_a_half, &never];
        let log = detect_on_grid(&events, &times, &states);
        assert_eq!(log.intervals, vec![vec![(1, 2)], vec![]]);
        assert_eq!(log.native_times, vec![Vec::<f64>::new(), Vec::new()]);
    }

    #[test]
    fn tracker_interpolates_crossing_time() {
        let g = |_t: f64, y: &[f64]| y[0] - 1.0;
        let events: [&dyn EventFunction; 1] = [&g];
        let mut tracker = CrossingTracker::new(&events, 0.0, &[0.0]);
        tracker.observe(0.0, 1.0, &[0.5]);
        tracker.observe(1.0, 2.0, &[1.5]);
        let times = tracker.into_times();
        assert_eq!(times.len(), 1);
        assert_eq!(times[0].len(), 1);
        assert!((times[0][0] - 1.5).abs() < 1e-12);
    }
}
