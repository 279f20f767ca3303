//! Step damping between the computed target and the emitted setpoint.
//!
//! Going all the way to a new target in one cycle makes the loop oscillate:
//! solar output adapts, battery voltage moves with internal resistance, and
//! the next decision overshoots back. The damper moves partway instead, with
//! the first step aggressive and later steps progressively smaller while the
//! goal stays put.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct DamperConfig {
    /// Fraction of the remaining distance covered by the first step
    pub f_step: f64,
    /// Minimum step (W); also the "stable change" threshold
    pub p_step: f64,
    /// Damping only applies when SoC is within this margin of empty/full
    pub f_delta: f64,
}

impl From<&crate::config::SystemConfig> for DamperConfig {
    fn from(cfg: &crate::config::SystemConfig) -> Self {
        Self {
            f_step: cfg.f_step,
            p_step: cfg.p_step,
            f_delta: cfg.f_delta,
        }
    }
}

/// Mutable damper state carried across cycles.
#[derive(Debug, Clone, Serialize)]
pub struct Damper {
    /// Last emitted scalar setpoint (W)
    pub last_p: f64,
    /// Most recent target handed to the damper (W)
    pub dest_p: f64,
    step: u32,
}

impl Damper {
    /// Seed from the system's current operating point so the first cycle
    /// steps from where the inverter actually is.
    pub fn seeded(p_now: f64) -> Self {
        Self {
            last_p: p_now,
            dest_p: p_now,
            step: 1,
        }
    }

    /// Whether `p` and `q` are close enough to count as "the same" target:
    /// within `p_step` of each other, or same-signed and within ±20 % once
    /// offset by `p_step`.
    pub fn small_step(cfg: &DamperConfig, p: f64, q: f64) -> bool {
        if (p - q).abs() < cfg.p_step {
            return true;
        }
        if (p > 0.0) != (q > 0.0) {
            return false;
        }
        let ratio = (cfg.p_step + p.abs()) / (cfg.p_step + q.abs());
        10.0 / 12.0 < ratio && ratio < 12.0 / 10.0
    }

    /// Convert a fresh target into the setpoint actually emitted this cycle.
    ///
    /// Returns the new setpoint and whether damping was applied.
    pub fn apply(&mut self, cfg: &DamperConfig, p: f64, soc: f64) -> (f64, bool) {
        let mid_band = cfg.f_delta <= soc && soc <= 1.0 - cfg.f_delta;
        if mid_band || Self::small_step(cfg, self.last_p, p) {
            // Small change, or far enough from the SoC extremes not to care.
            self.step = 1;
            self.dest_p = p;
            self.last_p = p;
            return (p, false);
        }

        if Self::small_step(cfg, self.dest_p, p) {
            // Same goal as last cycle: keep shrinking the steps.
            self.step += 1;
        } else {
            self.step = 2;
        }

        let mut pd = (p - self.last_p) * cfg.f_step.powf(2.0 / f64::from(self.step));
        if pd.abs() < cfg.p_step {
            pd = cfg.p_step.copysign(pd);
        }
        let np = self.last_p + pd;

        self.dest_p = p;
        self.last_p = np;
        (np, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn cfg() -> DamperConfig {
        DamperConfig {
            f_step: 0.35,
            p_step: 100.0,
            f_delta: 0.2,
        }
    }

    #[test]
    fn mid_band_soc_passes_through() {
        let mut damper = Damper::seeded(0.0);
        let (np, damped) = damper.apply(&cfg(), 5000.0, 0.5);
        assert_eq!(np, 5000.0);
        assert!(!damped);
        assert_eq!(damper.last_p, 5000.0);
    }

    #[test]
    fn near_full_battery_steps_partway() {
        let mut damper = Damper::seeded(0.0);
        let (np, damped) = damper.apply(&cfg(), 1000.0, 0.95);
        assert!(damped);
        // first damped step covers f_step^(2/2) = 35% of the distance
        assert!((np - 350.0).abs() < 1e-9);
        assert_eq!(damper.dest_p, 1000.0);

        // same goal again: step counter grows, stride shrinks in ratio but
        // keeps moving toward the goal
        let (np2, damped2) = damper.apply(&cfg(), 1000.0, 0.95);
        assert!(damped2);
        assert!(np2 > np && np2 < 1000.0);
    }

    #[test]
    fn small_changes_are_applied_directly_even_near_full() {
        let mut damper = Damper::seeded(960.0);
        let (np, damped) = damper.apply(&cfg(), 1000.0, 0.97);
        assert_eq!(np, 1000.0);
        assert!(!damped);
    }

    #[test]
    fn goal_change_resets_the_decay() {
        let c = cfg();
        let mut damper = Damper::seeded(0.0);
        damper.apply(&c, 2000.0, 0.95);
        damper.apply(&c, 2000.0, 0.95);
        let before = damper.last_p;

        // a very different goal restarts at step 2
        let (np, _) = damper.apply(&c, -3000.0, 0.95);
        assert!((np - (before + (-3000.0 - before) * 0.35)).abs() < 1e-9);
    }

    #[test]
    fn minimum_step_is_enforced_then_small_steps_pass_through() {
        let c = cfg();
        let mut damper = Damper::seeded(0.0);

        let (np1, _) = damper.apply(&c, 400.0, 0.95);
        assert!((np1 - 140.0).abs() < 1e-9); // 400 * 0.35

        let (np2, _) = damper.apply(&c, 400.0, 0.95);
        assert!((np2 - np1 - 260.0 * 0.35f64.powf(2.0 / 3.0)).abs() < 1e-9);

        // the shrunk stride would be ~77 W; it gets pinned at p_step
        let (np3, damped3) = damper.apply(&c, 400.0, 0.95);
        assert!(damped3);
        assert!((np3 - np2 - 100.0).abs() < 1e-9);

        // the rest is below p_step and goes through undamped
        let (np4, damped4) = damper.apply(&c, 400.0, 0.95);
        assert_eq!(np4, 400.0);
        assert!(!damped4);
    }

    #[test]
    fn small_step_predicate_is_symmetric_and_covers_small_deltas() {
        let c = cfg();
        for (p, q) in [(0.0, 50.0), (900.0, 980.0), (-500.0, -520.0), (10_000.0, 10_900.0)] {
            assert!(Damper::small_step(&c, p, q));
            assert!(Damper::small_step(&c, q, p));
        }
        for (p, q) in [(500.0, -500.0), (0.0, 101.0), (1000.0, 2000.0)] {
            assert_eq!(Damper::small_step(&c, p, q), Damper::small_step(&c, q, p));
        }
        // opposite signs far apart are never "small"
        assert!(!Damper::small_step(&c, 500.0, -500.0));
    }

    proptest! {
        // Stepping toward a larger positive goal never overshoots it and
        // never moves backwards; mirrored for the negative side.
        #[test]
        fn damper_is_monotonic(last in 1.0..5_000.0f64, dist in 0.0..10_000.0f64) {
            let c = cfg();
            let p = last + dist;
            let mut damper = Damper::seeded(last);
            let (np, _) = damper.apply(&c, p, 0.95);
            prop_assert!(np >= last - 1e-9);
            prop_assert!(np <= p + 1e-9);

            let mut damper = Damper::seeded(-last);
            let (np, _) = damper.apply(&c, -p, 0.95);
            prop_assert!(np <= -last + 1e-9);
            prop_assert!(np >= -p - 1e-9);
        }
    }
}
