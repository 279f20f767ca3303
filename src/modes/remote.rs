use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use super::{Emitter, ModeSpec, CYCLE_RETRY};
use crate::controller::Controller;
use crate::distkv::DistStore;

const LONG: &str = "\
Dynamic control driven by an external key-value store and SoC thresholds \
(all thresholds are fractions in [0, 1]). Between soc_low and soc_high the \
inverter supplies 'power' to the grid. Above soc_high it feeds out the \
larger of 'power' and the current solar surplus, until SoC drops below \
soc_high_ok. Below soc_low it switches to grid-zero (or plain zero when \
low_grid is off); below soc_low_zero the inverter stops entirely until \
soc_low is reached again. Normal operation resumes above soc_low_ok. The \
store may override 'power' and additionally provides a multiplicative \
'limit' factor and an absolute 'p_limit' cap on the feed-out.";

pub static SPEC: ModeSpec = ModeSpec {
    name: "remote",
    summary: "Remote controlled inverter behaviour.",
    params: &[
        ("power", "Max power to send to the grid"),
        ("low_grid", "Do grid-zero when the battery is low?"),
        ("soc_low_zero", "SoC lower? stop the inverter"),
        ("soc_low", "SoC lower? start grid-only mode"),
        ("soc_low_ok", "SoC higher? end grid-only mode"),
        ("soc_high", "SoC higher? start feed-out mode"),
        ("soc_high_ok", "SoC lower? end feed-out mode"),
        ("limit", "Multiplicative feed-out factor in [0, 1]"),
        ("p_limit", "Absolute feed-out cap in watts"),
        ("_l", LONG),
    ],
    run,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
enum SubMode {
    Constant,
    Stop,
    GridOnly,
    FeedOut,
}

/// Threshold set with the interdependent clamps applied.
struct Thresholds {
    low_zero: f64,
    low: f64,
    low_ok: f64,
    high: f64,
    high_ok: f64,
}

impl Thresholds {
    fn read(ctrl: &Controller) -> Self {
        let low = ctrl.op_f64_or("soc_low", 0.20).clamp(0.10, 0.80);
        let high = ctrl.op_f64_or("soc_high", 0.90).min(0.97).max(low + 0.10);
        Self {
            low_zero: ctrl.op_f64_or("soc_low_zero", 0.99).min(low - 0.02).max(0.05),
            low,
            low_ok: ctrl.op_f64_or("soc_low_ok", 0.0).max(low + 0.02),
            high,
            high_ok: ctrl.op_f64_or("soc_high_ok", 0.85).min(0.95).max(high - 0.02),
        }
    }

    fn advance(&self, mode: SubMode, soc: f64) -> SubMode {
        let mut mode = mode;
        if soc <= self.low_zero {
            mode = SubMode::Stop;
        } else if mode == SubMode::Stop && soc >= self.low {
            mode = SubMode::GridOnly;
        }

        if mode != SubMode::Stop && soc <= self.low {
            mode = SubMode::GridOnly;
        } else if matches!(mode, SubMode::Stop | SubMode::GridOnly) && soc >= self.low_ok {
            mode = SubMode::Constant;
        }

        if soc >= self.high {
            mode = SubMode::FeedOut;
        } else if mode == SubMode::FeedOut && soc <= self.high_ok {
            mode = SubMode::Constant;
        }
        mode
    }
}

async fn store_f64(store: &dyn DistStore, key: &str) -> Option<f64> {
    match store.get(key).await {
        Ok(value) => value.and_then(|v| v.as_f64()),
        Err(err) => {
            debug!(key, error = %err, "store read failed");
            None
        }
    }
}

fn run(ctrl: Arc<Controller>) -> BoxFuture<'static, Result<()>> {
    Box::pin(async move {
        let mut emitter = Emitter::new();
        let mut mode = SubMode::FeedOut;
        let root = ctrl
            .config()
            .distkv
            .as_ref()
            .map(|d| d.root.clone())
            .unwrap_or_else(|| "solar".to_string());
        let name = ctrl.config().name.clone();

        loop {
            let soc = match ctrl.soc() {
                Ok(soc) => soc,
                Err(err) => {
                    info!(error = %err, "cycle skipped");
                    tokio::time::sleep(CYCLE_RETRY).await;
                    continue;
                }
            };

            let thresholds = Thresholds::read(&ctrl);
            let next = thresholds.advance(mode, soc);
            if next != mode {
                info!(from = %mode, to = %next, soc, "remote submode change");
                mode = next;
            }

            // operator parameters, overridable through the store
            let mut power = ctrl.op_f64_or("power", 0.0).max(0.0);
            let mut limit = ctrl.op_f64_or("limit", 1.0);
            let mut p_limit = ctrl.op_f64("p_limit");
            if let Some(store) = ctrl.store.as_deref() {
                if let Some(v) = store_f64(store, &format!("{root}/power/{name}")).await {
                    power = v.max(0.0);
                }
                if let Some(v) = store_f64(store, &format!("{root}/limit/{name}")).await {
                    limit = v;
                }
                if let Some(v) = store_f64(store, &format!("{root}/power_limit/{name}")).await {
                    p_limit = Some(v);
                }
            }
            let cap = |p: f64| {
                let p = p * limit.clamp(0.0, 1.0);
                p_limit.map_or(p, |max| p.min(max))
            };

            let low_grid = ctrl.op_bool_or("low_grid", true);
            // grid target (p) or direct inverter target (ip), never both
            let mut p = None;
            let mut ip = None;
            match mode {
                SubMode::Stop => ip = Some(0.0),
                SubMode::GridOnly if !low_grid => ip = Some(0.0),
                SubMode::GridOnly => ip = Some(ctrl.solar_p().min(ctrl.p_cons_total())),
                SubMode::FeedOut => {
                    p = Some(cap((ctrl.solar_p() - ctrl.p_cons_total()).max(power)));
                }
                SubMode::Constant => p = Some(cap(power)),
            }

            ctrl.diag_set(
                "remote",
                json!({ "submode": mode, "soc": soc, "p": p, "ip": ip, "limit": limit, "p_limit": p_limit }),
            );

            let cycle = match ip {
                Some(ip) => ctrl.calc_inv_p(ip, Some(0.0), None),
                None => ctrl.calc_grid_p(-p.unwrap_or(0.0), Some(0.0)),
            };
            match cycle {
                Ok(ps) => {
                    if let Err(err) = emitter.set_inv_ps(&ctrl, ps).await {
                        info!(error = %err, "emission skipped");
                        tokio::time::sleep(CYCLE_RETRY).await;
                    }
                }
                Err(err) => {
                    info!(error = %err, "cycle skipped");
                    tokio::time::sleep(CYCLE_RETRY).await;
                }
            }
        }
    })
}
