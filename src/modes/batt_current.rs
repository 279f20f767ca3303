use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use tracing::info;

use super::{Emitter, ModeSpec, CYCLE_RETRY};
use crate::controller::Controller;

const LONG: &str = "\
Strives to hold the battery current constant. It basically sets AC output \
to the difference between PV input and your intended battery current. Note \
that the charge ecosystem is not told about your current cap: if the solar \
array supplies more than the inverter can (or is allowed to) feed to the AC \
side, the battery will get more than you specify.";

pub static SPEC: ModeSpec = ModeSpec {
    name: "i_batt",
    summary: "Set total current from/to the battery.",
    params: &[
        ("current", "Current to take from(+) / send to(-) the battery"),
        ("_l", LONG),
    ],
    run,
};

fn run(ctrl: Arc<Controller>) -> BoxFuture<'static, Result<()>> {
    Box::pin(async move {
        let mut emitter = Emitter::new();
        loop {
            let current = ctrl.op_f64_or("current", 0.0);
            match ctrl.calc_batt_i(current) {
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
