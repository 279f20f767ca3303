use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use tracing::info;

use super::{Emitter, ModeSpec, CYCLE_RETRY};
use crate::controller::Controller;

const LONG: &str = "\
Strives to maintain a constant flow of power through the inverter. If \
'power' is negative, the battery will be charged until its voltage is at \
the current max charge voltage, as reported by the BMS. If 'phase' is set, \
only this phase will be used.";

pub static SPEC: ModeSpec = ModeSpec {
    name: "p_inv",
    summary: "Set total power from/to the inverter.",
    params: &[
        ("power", "Power for the inverter to send to(+) / take from(-) AC"),
        ("excess", "Additional power to send if available / battery full. -1=unlimited"),
        ("phase", "Phase to (ab)use. Default: distribute per load."),
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
            let phase = ctrl.op_f64("phase").map(|p| p as usize);
            match ctrl.calc_inv_p(power, excess, phase) {
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
