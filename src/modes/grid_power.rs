use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use tracing::info;

use super::{Emitter, ModeSpec, CYCLE_RETRY};
use crate::controller::Controller;

const LONG: &str = "\
Strives to maintain a constant flow of power from/to the grid. It tries to \
balance grid phases, but it will never charge from one phase and discharge \
from another. If the inverter on one phase maxes out, remaining power gets \
distributed to other phases. If power is available, the battery is charged \
until the voltage approaches the max charge voltage reported by the BMS.";

pub static SPEC: ModeSpec = ModeSpec {
    name: "p_grid",
    summary: "Set total power from/to the external grid.",
    params: &[
        ("power", "Power to take from(+) / send to(-) the grid"),
        ("excess", "Max PV power to the grid if the battery is limited/full. -1=unlimited"),
        ("_l", LONG),
    ],
    run,
};

fn run(ctrl: Arc<Controller>) -> BoxFuture<'static, Result<()>> {
    Box::pin(async move {
        let mut emitter = Emitter::new();
        loop {
            let power = ctrl.op_f64_or("power", 0.0);
            let excess = ctrl.op_excess();
            match ctrl.calc_grid_p(power, excess) {
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
