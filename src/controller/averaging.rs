//! Derived telemetry: the battery-current running mean and the decaying
//! PV maximum with its self-tightening drop margin.

use std::collections::VecDeque;
use std::time::Duration;

use tracing::error;

/// Battery-current sampling period.
pub const BATT_AVG_PERIOD: Duration = Duration::from_millis(1100);
/// PV tracker update period.
pub const PV_TRACK_PERIOD: Duration = Duration::from_millis(900);

const WINDOW: usize = 4;
const DECAY_DIVISOR: f64 = 20.0;

/// Sliding window over the last four battery-current samples.
///
/// The average reads 0 until the window is full of valid samples, so early
/// cycles see a neutral value instead of a half-filled mean.
#[derive(Debug, Clone)]
pub struct CurrentWindow {
    samples: VecDeque<Option<f64>>,
}

impl CurrentWindow {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::from(vec![None; WINDOW]),
        }
    }

    /// Record one sample (absent telemetry counts as an invalid sample) and
    /// return the current average.
    pub fn push(&mut self, sample: Option<f64>) -> f64 {
        self.samples.pop_front();
        self.samples.push_back(sample);
        self.average()
    }

    pub fn average(&self) -> f64 {
        let mut sum = 0.0;
        for sample in &self.samples {
            match sample {
                Some(v) => sum += v,
                None => return 0.0,
            }
        }
        sum / self.samples.len() as f64
    }
}

impl Default for CurrentWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Decaying maximum of the PV current plus the drop-margin estimate.
///
/// The margin says how far PV output is assumed to be able to fall between
/// two control cycles. When reality falls faster than the margin allows, the
/// margin is tightened to what was just observed.
#[derive(Debug, Clone)]
pub struct PvTracker {
    pub i_pv_max: f64,
    pub pv_margin: f64,
    shrink_min: f64,
}

impl PvTracker {
    pub fn new(pv_margin: f64, shrink_min: f64) -> Self {
        Self {
            i_pv_max: 0.0,
            pv_margin,
            shrink_min,
        }
    }

    /// Feed one PV current sample.
    pub fn observe(&mut self, i_pv: f64) {
        if self.i_pv_max < i_pv {
            self.i_pv_max = i_pv;
        } else if self.i_pv_max > self.shrink_min && i_pv < self.i_pv_max * self.pv_margin {
            let margin = i_pv / self.i_pv_max;
            error!(
                old = self.pv_margin,
                new = margin,
                "PV dropped faster than the margin allows, tightening"
            );
            self.pv_margin = margin;
        } else {
            self.i_pv_max += (i_pv - self.i_pv_max) / DECAY_DIVISOR;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_is_zero_until_window_fills() {
        let mut window = CurrentWindow::new();
        assert_eq!(window.push(Some(10.0)), 0.0);
        assert_eq!(window.push(Some(20.0)), 0.0);
        assert_eq!(window.push(Some(30.0)), 0.0);
        assert_eq!(window.push(Some(40.0)), 25.0);
        assert_eq!(window.push(Some(50.0)), 35.0);
    }

    #[test]
    fn absent_sample_resets_to_zero() {
        let mut window = CurrentWindow::new();
        for _ in 0..4 {
            window.push(Some(8.0));
        }
        assert_eq!(window.average(), 8.0);
        assert_eq!(window.push(None), 0.0);
    }

    #[test]
    fn pv_max_adopts_rises_and_decays_falls() {
        let mut pv = PvTracker::new(0.4, 1000.0);
        pv.observe(100.0);
        assert_eq!(pv.i_pv_max, 100.0);

        pv.observe(60.0);
        // decays by (60-100)/20 = -2
        assert!((pv.i_pv_max - 98.0).abs() < 1e-9);
        assert_eq!(pv.pv_margin, 0.4);
    }

    #[test]
    fn margin_tightens_only_above_the_shrink_threshold() {
        let mut pv = PvTracker::new(0.4, 1000.0);
        pv.observe(500.0);
        // a 90% drop, but the stored max is below the threshold: decay only
        pv.observe(50.0);
        assert_eq!(pv.pv_margin, 0.4);

        let mut pv = PvTracker::new(0.4, 100.0);
        pv.observe(500.0);
        pv.observe(50.0);
        // now the drop is proof the prior margin was optimistic
        assert!((pv.pv_margin - 0.1).abs() < 1e-9);
        assert_eq!(pv.i_pv_max, 500.0);
    }
}
