//! The layered constraint pipeline.
//!
//! `decide` turns a requested AC power into one the installation can actually
//! sustain. Rules run in a fixed order: DC-side current limits first, grid
//! power clamps, the PV-drop safety, and finally the hard battery clamp.
//! Every rule leaves a trace in the decision so an operator can audit why a
//! setpoint came out the way it did.

use serde::Serialize;
use serde_json::json;

/// Conversion AC power → DC current at the bus bar.
///
/// `rev` asks for the current you would have to move for a given AC power
/// (losses work against you); without `rev` you get the current a given AC
/// power produces.
pub fn i_from_p(p: f64, u_dc: f64, inv_eff: f64, rev: bool) -> f64 {
    let res = -p / u_dc;
    if rev {
        res / inv_eff
    } else {
        res * inv_eff
    }
}

/// Conversion DC current → AC power; exact inverse of [`i_from_p`] with the
/// opposite `rev` flag.
pub fn p_from_i(i: f64, u_dc: f64, inv_eff: f64, rev: bool) -> f64 {
    let res = -i * u_dc;
    if rev {
        res / inv_eff
    } else {
        res * inv_eff
    }
}

/// Static tuning of the pipeline, taken from `[system]` config.
#[derive(Debug, Clone)]
pub struct LimitConfig {
    pub top_off: bool,
    pub umax_diff: f64,
    pub umin_diff: f64,
    pub pg_min: f64,
    pub pg_max: f64,
    pub inv_eff: f64,
    pub pv_delta: f64,
    pub cap_scale: f64,
}

impl From<&crate::config::SystemConfig> for LimitConfig {
    fn from(cfg: &crate::config::SystemConfig) -> Self {
        Self {
            top_off: cfg.top_off,
            umax_diff: cfg.umax_diff,
            umin_diff: cfg.umin_diff,
            pg_min: cfg.pg_min,
            pg_max: cfg.pg_max,
            inv_eff: cfg.inv_eff,
            pv_delta: cfg.pv_delta,
            cap_scale: cfg.cap_scale,
        }
    }
}

/// Live quantities the pipeline works on.
///
/// Currents are amps at the battery bus bar, positive = from battery to bus.
/// Powers are watts on the AC side, positive = feed to AC.
#[derive(Debug, Clone)]
pub struct LimitInputs {
    /// Desired AC power
    pub p_req: f64,
    /// Extra export permitted above `p_req` when the battery cannot absorb more
    pub excess: Option<f64>,
    /// Battery voltage, compensated for internal resistance
    pub u_dc: f64,
    /// Current solar input
    pub i_pv: f64,
    /// Decaying recent maximum of the solar input
    pub i_pv_max: f64,
    /// Fraction of `i_pv_max` the solar input is assumed not to drop below
    pub pv_margin: f64,
    /// Max charge current (≤ 0; zero when the BMS disallows charging)
    pub ib_min: f64,
    /// Max discharge current (≥ 0; zero when the BMS disallows discharging)
    pub ib_max: f64,
    /// BMS low-voltage bound
    pub u_min: f64,
    /// BMS max charge voltage
    pub u_max: f64,
    /// Battery capacity (Ah), scales the voltage-taper current limits
    pub b_cap: f64,
}

impl LimitInputs {
    pub fn validate(&self) -> Result<(), String> {
        for (name, v) in [
            ("p_req", self.p_req),
            ("u_dc", self.u_dc),
            ("i_pv", self.i_pv),
            ("i_pv_max", self.i_pv_max),
            ("pv_margin", self.pv_margin),
            ("ib_min", self.ib_min),
            ("ib_max", self.ib_max),
            ("u_min", self.u_min),
            ("u_max", self.u_max),
            ("b_cap", self.b_cap),
        ] {
            if !v.is_finite() {
                return Err(format!("{name} is not finite: {v}"));
            }
        }
        if self.u_dc <= 0.0 {
            return Err(format!("u_dc must be positive: {}", self.u_dc));
        }
        if self.ib_min > 0.0 || self.ib_max < 0.0 {
            return Err(format!(
                "battery bounds must straddle zero: [{}, {}]",
                self.ib_min, self.ib_max
            ));
        }
        if self.u_min >= self.u_max {
            return Err(format!(
                "voltage window is empty: [{}, {}]",
                self.u_min, self.u_max
            ));
        }
        Ok(())
    }
}

/// One rule's audit record.
#[derive(Debug, Clone, Serialize)]
pub struct LimitTrace {
    pub rule: &'static str,
    pub fired: bool,
    pub check: &'static str,
    pub inputs: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

/// Outcome of one pipeline run: the sustainable AC power plus the audit trail.
#[derive(Debug, Clone)]
pub struct Decision {
    pub p: f64,
    pub traces: Vec<LimitTrace>,
    /// The final battery clamp fired, meaning an earlier rule missed a case.
    pub hard_clamped: bool,
}

impl Decision {
    /// Traces of rules that actually adjusted the working state.
    pub fn fired(&self) -> impl Iterator<Item = &LimitTrace> {
        self.traces.iter().filter(|t| t.fired)
    }
}

/// Run the ordered constraint pipeline on a requested AC power.
pub fn decide(cfg: &LimitConfig, inp: &LimitInputs) -> Decision {
    let mut traces = Vec::with_capacity(10);

    let mut i_inv = i_from_p(inp.p_req, inp.u_dc, cfg.inv_eff, true);
    let mut i_batt = -i_inv - inp.i_pv;

    // I_PVD: keep pv_delta of headroom below the discharge limit so that
    // rising PV can be observed before the charger ceiling clips it.
    let i_max = inp.ib_max - i_inv;
    let fired = inp.i_pv_max > cfg.pv_delta && i_max - i_batt < cfg.pv_delta;
    traces.push(LimitTrace {
        rule: "I_PVD",
        fired,
        check: "pvmax>pvdelta, imax-ib<pvdelta",
        inputs: json!({ "pvmax": inp.i_pv_max, "pvdelta": cfg.pv_delta, "imax": i_max, "ib": i_batt }),
        fix: fired.then_some("ib=imax-pvdelta"),
        result: None,
    });
    if fired {
        // i_inv stays as-is here; any later rule that fires recomputes it
        i_batt = i_max - cfg.pv_delta;
        if let Some(t) = traces.last_mut() {
            t.result = Some(json!({ "batt": i_batt }));
        }
    }

    // U_MAX: taper the charge current as u_dc approaches the charge ceiling.
    let top = if cfg.top_off { 0.0 } else { cfg.umax_diff };
    let i_maxchg = inp.b_cap / cfg.cap_scale * (top - (inp.u_max - inp.u_dc)) / cfg.umax_diff;
    let fired = i_batt < i_maxchg;
    traces.push(LimitTrace {
        rule: "U_MAX",
        fired,
        check: "ib<max",
        inputs: json!({ "max": i_maxchg, "cap_lim": inp.b_cap / cfg.cap_scale, "umax": inp.u_max, "udc": inp.u_dc, "ib": i_batt }),
        fix: fired.then_some("ib=max"),
        result: None,
    });
    if fired {
        i_batt = i_maxchg;
        i_inv = -i_batt - inp.i_pv;
        if let Some(t) = traces.last_mut() {
            t.result = Some(json!({ "batt": i_batt, "inv": i_inv }));
        }
    }

    // U_MIN: same taper on the discharge side.
    let i_maxdis = -inp.b_cap / cfg.cap_scale * (cfg.umin_diff - (inp.u_dc - inp.u_min)) / cfg.umin_diff;
    let fired = i_batt > i_maxdis;
    traces.push(LimitTrace {
        rule: "U_MIN",
        fired,
        check: "ib>min",
        inputs: json!({ "min": i_maxdis, "cap_lim": inp.b_cap / cfg.cap_scale, "umin": inp.u_min, "udc": inp.u_dc, "ib": i_batt }),
        fix: fired.then_some("ib=min"),
        result: None,
    });
    if fired {
        i_batt = i_maxdis;
        i_inv = -i_batt - inp.i_pv;
        if let Some(t) = traces.last_mut() {
            t.result = Some(json!({ "batt": i_batt, "inv": i_inv }));
        }
    }

    // I_MAX: the system caps the solar chargers at (-ib_min - i_inv); keep
    // pv_delta of headroom under that cap so rising PV is not clipped.
    let i_pv_ceiling = -inp.ib_min - i_inv;
    let fired = i_pv_ceiling - inp.i_pv < cfg.pv_delta;
    traces.push(LimitTrace {
        rule: "I_MAX",
        fired,
        check: "max-ipv<pvdelta",
        inputs: json!({ "max": i_pv_ceiling, "ipv": inp.i_pv, "pvdelta": cfg.pv_delta, "ibmin": inp.ib_min, "inv": i_inv }),
        fix: fired.then_some("ib-=d"),
        result: None,
    });
    if fired {
        let d = cfg.pv_delta - (i_pv_ceiling - inp.i_pv);
        i_batt -= d;
        i_inv = -i_batt - inp.i_pv;
        if let Some(t) = traces.last_mut() {
            t.result = Some(json!({ "d": d, "batt": i_batt, "inv": i_inv }));
        }
    }

    // Over to the AC side for the grid clamps.
    let mut p = p_from_i(i_inv, inp.u_dc, cfg.inv_eff, false);

    let fired = p < cfg.pg_min;
    traces.push(LimitTrace {
        rule: "P_MIN",
        fired,
        check: "p<min",
        inputs: json!({ "p": p, "min": cfg.pg_min }),
        fix: fired.then_some("p=min"),
        result: fired.then(|| json!(cfg.pg_min)),
    });
    if fired {
        p = cfg.pg_min;
    }

    let fired = p > cfg.pg_max;
    traces.push(LimitTrace {
        rule: "P_MAX",
        fired,
        check: "p>max",
        inputs: json!({ "p": p, "max": cfg.pg_max }),
        fix: fired.then_some("p=max"),
        result: fired.then(|| json!(cfg.pg_max)),
    });
    if fired {
        p = cfg.pg_max;
    }

    // I_MIN: if PV suddenly drops to its conservative minimum, the battery
    // must not be forced past its discharge limit.
    i_inv = i_from_p(p, inp.u_dc, cfg.inv_eff, true);
    let i_pv_min = inp.i_pv_max * inp.pv_margin;
    let fired = -i_inv - i_pv_min > inp.ib_max;
    traces.push(LimitTrace {
        rule: "I_MIN",
        fired,
        check: "-inv-pvmin>ibmax",
        inputs: json!({ "inv": i_inv, "pvmin": i_pv_min, "ibmax": inp.ib_max, "max": inp.i_pv_max, "margin": inp.pv_margin }),
        fix: fired.then_some("inv=-pvmin-ibmax"),
        result: None,
    });
    if fired {
        i_inv = -i_pv_min - inp.ib_max;
        i_batt = -i_inv - inp.i_pv;
        if let Some(t) = traces.last_mut() {
            t.result = Some(json!({ "batt": i_batt, "inv": i_inv }));
        }
    }

    // Hard battery clamp. Anything caught here slipped past the rules above.
    // The clamp judges the battery share implied by the current working
    // point; grid clamps above may have moved i_inv without touching i_batt.
    i_batt = -i_inv - inp.i_pv;
    let mut hard_clamped = false;

    let fired = i_batt < inp.ib_min;
    traces.push(LimitTrace {
        rule: "IB_ERR_L",
        fired,
        check: "batt<min",
        inputs: json!({ "batt": i_batt, "min": inp.ib_min }),
        fix: fired.then_some("batt=min"),
        result: None,
    });
    if fired {
        i_batt = inp.ib_min;
        i_inv = -i_batt - inp.i_pv;
        hard_clamped = true;
        if let Some(t) = traces.last_mut() {
            t.result = Some(json!({ "batt": i_batt, "inv": i_inv }));
        }
    }

    let fired = i_batt > inp.ib_max;
    traces.push(LimitTrace {
        rule: "IB_ERR_H",
        fired,
        check: "batt>max",
        inputs: json!({ "batt": i_batt, "max": inp.ib_max }),
        fix: fired.then_some("batt=max"),
        result: None,
    });
    if fired {
        i_batt = inp.ib_max;
        i_inv = -i_batt - inp.i_pv;
        hard_clamped = true;
        if let Some(t) = traces.last_mut() {
            t.result = Some(json!({ "batt": i_batt, "inv": i_inv }));
        }
    }

    p = p_from_i(i_inv, inp.u_dc, cfg.inv_eff, false);

    // P_EXC: with a full battery, cap how far the feed-out may exceed the request.
    let fired = match inp.excess {
        Some(excess) => p > 0.0 && p > inp.p_req + excess,
        None => false,
    };
    traces.push(LimitTrace {
        rule: "P_EXC",
        fired,
        check: "p>req+exc, p>0",
        inputs: json!({ "p": p, "req": inp.p_req, "exc": inp.excess }),
        fix: fired.then_some("p=req+exc"),
        result: None,
    });
    if fired {
        p = inp.p_req + inp.excess.unwrap_or(0.0);
        if let Some(t) = traces.last_mut() {
            t.result = Some(json!(p));
        }
    }

    Decision {
        p,
        traces,
        hard_clamped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    // The reference rig: a big battery far away from both voltage bounds, a
    // deliberately lossy inverter so efficiency handling shows up in the
    // numbers, and tight PV headroom.
    fn rig() -> (LimitConfig, LimitInputs) {
        let cfg = LimitConfig {
            top_off: false,
            umax_diff: 0.001,
            umin_diff: 0.001,
            pg_min: -1100.0,
            pg_max: 1100.0,
            inv_eff: 0.25,
            pv_delta: 10.0,
            cap_scale: 4.0,
        };
        let inp = LimitInputs {
            p_req: 0.0,
            excess: None,
            u_dc: 100.0,
            i_pv: 0.0,
            i_pv_max: 0.0,
            pv_margin: 0.5,
            ib_min: -20.0,
            ib_max: 40.0,
            u_min: 50.0,
            u_max: 200.0,
            b_cap: 1000.0,
        };
        (cfg, inp)
    }

    #[rstest]
    #[case::zero(0.0, 0.0, 0.0, -20.0, 40.0, 0.0)]
    #[case::small_out(100.0, 0.0, 0.0, -20.0, 40.0, 100.0)]
    #[case::small_in(-100.0, 0.0, 0.0, -20.0, 40.0, -100.0)]
    #[case::pv_headroom_tightens_export(1000.0, 55.0, 0.0, -20.0, 40.0, 875.0)]
    #[case::grid_cap(2000.0, 0.0, 0.0, -20.0, 100.0, 1100.0)]
    #[case::big_battery_uncapped(1000.0, 0.0, 0.0, -20.0, 100.0, 1000.0)]
    #[case::charge_cap(-1000.0, 0.0, 0.0, -20.0, 40.0, -500.0)]
    #[case::charge_grid_cap(-1200.0, 0.0, 0.0, -100.0, 40.0, -1100.0)]
    #[case::surplus_pv_absorbed(0.0, 50.0, 50.0, -20.0, 40.0, 750.0)]
    #[case::pv_with_headroom(1000.0, 50.0, 50.0, -20.0, 100.0, 1000.0)]
    fn single_phase_scenarios(
        #[case] p_req: f64,
        #[case] i_pv: f64,
        #[case] i_pv_max: f64,
        #[case] ib_min: f64,
        #[case] ib_max: f64,
        #[case] expected: f64,
    ) {
        let (cfg, mut inp) = rig();
        inp.p_req = p_req;
        inp.i_pv = i_pv;
        inp.i_pv_max = i_pv_max;
        inp.ib_min = ib_min;
        inp.ib_max = ib_max;

        let decision = decide(&cfg, &inp);
        assert!(
            (decision.p - expected).abs() < 1e-9,
            "decide({p_req}) = {}, expected {expected}",
            decision.p
        );
    }

    #[test]
    fn surplus_pv_respects_battery_clamp() {
        let (cfg, mut inp) = rig();
        inp.i_pv = 50.0;
        inp.i_pv_max = 50.0;

        let decision = decide(&cfg, &inp);
        // exporting 750 W at 25% efficiency draws 30 A; the battery keeps the
        // remaining 20 A of PV, exactly its charge limit
        let i_inv = i_from_p(decision.p, inp.u_dc, cfg.inv_eff, true);
        let i_batt = -i_inv - inp.i_pv;
        assert!((i_batt - inp.ib_min).abs() < 1e-9);
        assert!(decision.hard_clamped);
    }

    #[test]
    fn discharge_headroom_rule_fires_when_discharge_is_disallowed() {
        let (cfg, mut inp) = rig();
        inp.ib_max = 0.0; // BMS forbids discharging
        inp.i_pv = 5.0;
        inp.i_pv_max = 20.0;

        let decision = decide(&cfg, &inp);
        let trace = decision
            .traces
            .iter()
            .find(|t| t.rule == "I_PVD")
            .unwrap();
        assert!(trace.fired);
        assert!((decision.p - 0.0).abs() < 1e-9);
    }

    #[test]
    fn excess_caps_feed_out_above_request() {
        let (cfg, mut inp) = rig();
        inp.p_req = 0.0;
        inp.excess = Some(100.0);
        inp.i_pv = 50.0;
        inp.i_pv_max = 50.0;

        // unlimited would be 750 W (surplus PV); the cap holds it at req+excess
        let decision = decide(&cfg, &inp);
        assert!((decision.p - 100.0).abs() < 1e-9);
        assert!(decision.fired().any(|t| t.rule == "P_EXC"));
    }

    #[test]
    fn voltage_taper_limits_charge_near_u_max() {
        let (cfg, mut inp) = rig();
        // 0.6 V below the ceiling with 0.5 V headroom configured
        let cfg = LimitConfig {
            umax_diff: 0.5,
            umin_diff: 0.5,
            ..cfg
        };
        inp.u_dc = 55.4;
        inp.u_max = 56.0;
        inp.u_min = 48.0;
        inp.b_cap = 200.0;
        inp.ib_min = -100.0;
        inp.p_req = -4000.0;

        let decision = decide(&cfg, &inp);
        let i_inv = i_from_p(decision.p, inp.u_dc, cfg.inv_eff, true);
        let i_batt = -i_inv - inp.i_pv;
        // i_maxchg = 200/4 * (0.5 - 0.6)/0.5 = -10 A: charge tapers to 10 A
        assert!((i_batt - (-10.0)).abs() < 1e-6);
        assert!(decision.fired().any(|t| t.rule == "U_MAX"));
    }

    #[test]
    fn pv_drop_safety_limits_discharge() {
        let (cfg, mut inp) = rig();
        inp.p_req = 1100.0;
        inp.i_pv = 60.0;
        inp.i_pv_max = 60.0;
        inp.pv_margin = 0.5;
        inp.ib_max = 5.0;
        inp.ib_min = -30.0;

        let decision = decide(&cfg, &inp);
        // if PV drops to 30 A, the battery must not be pushed past 5 A out:
        // the inverter may draw at most 35 A
        let i_inv = i_from_p(decision.p, inp.u_dc, cfg.inv_eff, true);
        assert!(-i_inv <= 35.0 + 1e-9);
        assert!(decision.fired().any(|t| t.rule == "I_MIN"));
    }

    #[test]
    fn efficiency_roundtrip() {
        for p in [-4000.0, -100.0, -1.0, 1.0, 250.0, 9000.0] {
            for rev in [false, true] {
                let i = i_from_p(p, 48.0, 0.9, rev);
                let back = p_from_i(i, 48.0, 0.9, !rev);
                assert!((back - p).abs() < 1e-9, "p={p} rev={rev} back={back}");
            }
        }
    }

    #[test]
    fn validate_rejects_bad_windows() {
        let (_, mut inp) = rig();
        inp.ib_min = 5.0;
        assert!(inp.validate().is_err());

        let (_, mut inp) = rig();
        inp.u_min = inp.u_max;
        assert!(inp.validate().is_err());

        let (_, mut inp) = rig();
        inp.u_dc = f64::NAN;
        assert!(inp.validate().is_err());

        let (_, inp) = rig();
        assert!(inp.validate().is_ok());
    }

    proptest! {
        // Without an excess cap the emitted power always lands inside the
        // grid window and the implied battery current inside the BMS window.
        #[test]
        fn decision_respects_bounds(
            p_req in -20_000.0..20_000.0f64,
            i_pv in 0.0..60.0f64,
            pv_peak in 0.0..200.0f64,
        ) {
            let (cfg, mut inp) = rig();
            inp.p_req = p_req;
            inp.i_pv = i_pv;
            inp.i_pv_max = i_pv.max(pv_peak);

            let decision = decide(&cfg, &inp);
            prop_assert!(decision.p >= cfg.pg_min - 1e-6);
            prop_assert!(decision.p <= cfg.pg_max + 1e-6);

            let i_inv = i_from_p(decision.p, inp.u_dc, cfg.inv_eff, true);
            let i_batt = -i_inv - inp.i_pv;
            prop_assert!(i_batt >= inp.ib_min - 1e-6);
            prop_assert!(i_batt <= inp.ib_max + 1e-6);
        }
    }
}
