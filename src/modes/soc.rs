use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use tracing::info;

use super::{Emitter, ModeSpec, CYCLE_RETRY};
use crate::controller::Controller;

/// Band around the target inside which the battery current is held at zero.
const DEADBAND: f64 = 0.02;

const LONG: &str = "\
Charges or discharges the battery towards a given state of charge. Below \
the target it imports 'power_in' from the grid, above it it exports \
'power_out'; within a 2% band around the target the battery current is \
held at zero.";

pub static SPEC: ModeSpec = ModeSpec {
    name: "soc",
    summary: "Reach a given charge level.",
    params: &[
        ("dest_soc", "The SoC level to aim for, as a fraction in [0, 1]"),
        ("power_in", "Grid power while undercharged (W, positive = import)"),
        ("power_out", "Grid power while overcharged (W, negative = export)"),
        ("excess", "Additional power to send if available / battery full. -1=unlimited"),
        ("_l", LONG),
    ],
    run,
};

fn run(ctrl: Arc<Controller>) -> BoxFuture<'static, Result<()>> {
    Box::pin(async move {
        let mut emitter = Emitter::new();
        loop {
            let dest = ctrl.op_f64_or("dest_soc", 0.0);
            let power_in = ctrl.op_f64_or("power_in", 500.0);
            let power_out = ctrl.op_f64_or("power_out", -500.0);
            let excess = ctrl.op_excess();

            let cycle = ctrl.soc().and_then(|soc| {
                if (soc - dest).abs() <= DEADBAND {
                    ctrl.calc_batt_i(0.0)
                } else if soc < dest {
                    ctrl.calc_grid_p(power_in, excess)
                } else {
                    ctrl.calc_grid_p(power_out, excess)
                }
            });

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
