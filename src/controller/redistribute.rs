//! Overload redistribution across phases.
//!
//! After a setpoint vector has been emitted and the inverters' response has
//! been observed, phases that could not reach their request are detected by
//! comparing the written setpoint against the running power. The recorded
//! saturation point is remembered and the unreachable share is pushed onto
//! phases with headroom. A 50 W fudge keeps each limited phase slightly past
//! its recorded limit so the next round can tell whether the limit lifted.
//!
//! Everything here uses the wire sign convention: negative = feed to AC.

use serde::Serialize;

/// Written setpoint and observed running power of one phase, wire-signed.
#[derive(Debug, Clone, Copy)]
pub struct PhaseObservation {
    pub p_set: f64,
    pub p_run: f64,
}

/// Per-phase saturation estimates learned from previous emissions.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseLimits {
    /// Out-feeding saturation points (negative watts); `None` = unknown
    pub ps_min: Vec<Option<f64>>,
    /// Charging saturation points (positive watts); `None` = unknown
    pub ps_max: Vec<Option<f64>>,
}

impl PhaseLimits {
    pub fn unknown(n_phase: usize) -> Self {
        Self {
            ps_min: vec![None; n_phase],
            ps_max: vec![None; n_phase],
        }
    }
}

const DETECT_MARGIN: f64 = 20.0;
const RELEASE_MARGIN: f64 = 10.0;
const FUDGE: f64 = 50.0;

/// Move unreachable setpoint share from saturated phases onto others.
///
/// `ps` is the candidate vector for this emission, `observed` the previous
/// written setpoints and the resulting running powers. Updates the learned
/// limits in place and returns the adjusted vector.
pub fn redistribute(
    ps: &[f64],
    observed: &[PhaseObservation],
    limits: &mut PhaseLimits,
) -> Vec<f64> {
    let n = ps.len();
    debug_assert_eq!(observed.len(), n);
    debug_assert_eq!(limits.ps_min.len(), n);

    // First pass: refresh the learned limits and total up the shortfall.
    let mut pd_min = 0.0;
    let mut pd_max = 0.0;
    for i in 0..n {
        let p = ps[i];
        let PhaseObservation { p_set, p_run } = observed[i];

        if p_set < 0.0 {
            if p_set < p_run - DETECT_MARGIN {
                // the out-feeding side cannot keep up
                limits.ps_min[i] = Some(p_run);
                if p < p_run {
                    pd_min += p_run - p - FUDGE;
                }
            } else if let Some(p_min) = limits.ps_min[i] {
                if p_min >= p_run - RELEASE_MARGIN {
                    // no longer pinned there; forget the limit
                    limits.ps_min[i] = None;
                } else if p < 0.0 && p < p_min - FUDGE {
                    pd_min += p_min - p - FUDGE;
                }
            }
        } else if p_set > 0.0 {
            if p_set > p_run + DETECT_MARGIN {
                limits.ps_max[i] = Some(p_run);
                if p > p_run {
                    pd_max += p - p_run + FUDGE;
                }
            } else if let Some(p_max) = limits.ps_max[i] {
                if p_max <= p_run - RELEASE_MARGIN {
                    limits.ps_max[i] = None;
                } else if p > 0.0 && p > p_max - FUDGE {
                    pd_max += p_max - p + FUDGE;
                }
            }
        }
    }

    let mut pa: Vec<(usize, f64)> = ps.iter().copied().enumerate().collect();

    // Second pass, out-feeding side: clamp the worst-hit phases to just past
    // their limit and hand the accumulated deficit to phases with headroom.
    if pd_min > 0.0 {
        pa.sort_by(|a, b| {
            let key = |x: &(usize, f64)| -ps[x.0] + limits.ps_min[x.0].unwrap_or(f64::NEG_INFINITY);
            key(a).total_cmp(&key(b))
        });
        let mut pb = Vec::with_capacity(n);
        let mut d_min = 0.0;
        while let Some((i, mut v)) = pa.pop() {
            let p_min = limits.ps_min[i].unwrap_or(f64::NEG_INFINITY);
            if v < p_min {
                d_min += p_min - v;
                v = p_min - FUDGE;
            } else {
                let pp = d_min / (pa.len() + 1) as f64;
                if v - pp < p_min {
                    d_min -= v - p_min;
                    v = p_min - FUDGE;
                } else {
                    d_min -= pp + FUDGE;
                    v -= pp + FUDGE;
                }
            }
            pb.push((i, v));
        }
        pa = pb;
    }

    // Same in reverse for the charging side.
    if pd_max > 0.0 {
        pa.sort_by(|a, b| {
            let key = |x: &(usize, f64)| ps[x.0] - limits.ps_max[x.0].unwrap_or(f64::INFINITY);
            key(a).total_cmp(&key(b))
        });
        let mut pb = Vec::with_capacity(n);
        let mut d_max = 0.0;
        while let Some((i, mut v)) = pa.pop() {
            let p_max = limits.ps_max[i].unwrap_or(f64::INFINITY);
            if v > p_max {
                d_max += v - p_max;
                v = p_max + FUDGE;
            } else {
                let pp = d_max / (pa.len() + 1) as f64;
                if v + pp > p_max {
                    d_max -= p_max - v;
                    v = p_max + FUDGE;
                } else {
                    d_max -= pp + FUDGE;
                    v += pp + FUDGE;
                }
            }
            pb.push((i, v));
        }
        pa = pb;
    }

    pa.sort_by_key(|&(i, _)| i);
    pa.into_iter().map(|(_, v)| v).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn obs(p_set: f64, p_run: f64) -> PhaseObservation {
        PhaseObservation { p_set, p_run }
    }

    #[test]
    fn no_saturation_leaves_vector_untouched() {
        let mut limits = PhaseLimits::unknown(3);
        let ps = vec![-300.0, -300.0, -300.0];
        let observed = vec![obs(-300.0, -295.0); 3];
        let out = redistribute(&ps, &observed, &mut limits);
        assert_eq!(out, ps);
        assert!(limits.ps_min.iter().all(Option::is_none));
    }

    #[test]
    fn saturated_outfeed_moves_excess_to_other_phases() {
        let mut limits = PhaseLimits::unknown(3);
        // phase 0 was asked for -900 but only delivers -700
        let ps = vec![-900.0, -200.0, -200.0];
        let observed = vec![obs(-900.0, -700.0), obs(-200.0, -200.0), obs(-200.0, -200.0)];
        let out = redistribute(&ps, &observed, &mut limits);

        assert_eq!(limits.ps_min[0], Some(-700.0));
        // the saturated phase sits just past its recorded limit
        assert!((out[0] - (-750.0)).abs() < 1e-9);
        // the unreachable share went to the unconstrained phases
        assert!(out[1] < -200.0);
        assert!(out[2] < -200.0);

        let sum_in: f64 = ps.iter().sum();
        let sum_out: f64 = out.iter().sum();
        assert!((sum_in - sum_out).abs() <= FUDGE * ps.len() as f64);
    }

    #[test]
    fn recovered_phase_forgets_its_limit() {
        let mut limits = PhaseLimits::unknown(2);
        limits.ps_min[0] = Some(-700.0);
        // the phase was parked at limit−50 and now delivers past the limit
        let ps = vec![-400.0, -400.0];
        let observed = vec![obs(-750.0, -755.0), obs(-400.0, -405.0)];
        let out = redistribute(&ps, &observed, &mut limits);
        assert_eq!(limits.ps_min[0], None);
        assert_eq!(out, ps);
    }

    #[test]
    fn known_limit_triggers_redistribution_before_saturating_again() {
        let mut limits = PhaseLimits::unknown(2);
        limits.ps_min[0] = Some(-700.0);
        // the inverter currently runs short of the recorded limit, but the
        // new request digs well below it
        let ps = vec![-900.0, -200.0];
        let observed = vec![obs(-660.0, -650.0), obs(-200.0, -200.0)];
        let out = redistribute(&ps, &observed, &mut limits);
        assert_eq!(limits.ps_min[0], Some(-700.0));
        assert!((out[0] - (-750.0)).abs() < 1e-9);
        assert!(out[1] < -200.0);
    }

    #[test]
    fn saturated_charge_side_mirrors() {
        let mut limits = PhaseLimits::unknown(2);
        let ps = vec![900.0, 200.0];
        let observed = vec![obs(900.0, 600.0), obs(200.0, 200.0)];
        let out = redistribute(&ps, &observed, &mut limits);
        assert_eq!(limits.ps_max[0], Some(600.0));
        assert!((out[0] - 650.0).abs() < 1e-9);
        assert!(out[1] > 200.0);
    }

    proptest! {
        // One saturated phase, the rest unconstrained: the redistributed sum
        // stays within the 50 W-per-phase fudge of the requested sum.
        #[test]
        fn redistribution_approximately_preserves_sum(
            want in -2_000.0..-500.0f64,
            limit_frac in 0.3..0.9f64,
            others in proptest::collection::vec(-400.0..-10.0f64, 1..4),
        ) {
            let p_run = want * limit_frac;
            let mut ps = vec![want];
            ps.extend(&others);
            let mut observed = vec![obs(want, p_run)];
            observed.extend(others.iter().map(|&p| obs(p, p)));

            let mut limits = PhaseLimits::unknown(ps.len());
            let out = redistribute(&ps, &observed, &mut limits);

            let sum_in: f64 = ps.iter().sum();
            let sum_out: f64 = out.iter().sum();
            prop_assert!(
                (sum_in - sum_out).abs() <= FUDGE * ps.len() as f64 + 1e-6,
                "in={sum_in} out={sum_out} ps={ps:?} out={out:?}"
            );
        }
    }
}
