use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;
use tracing::info;

use super::ModeSpec;
use crate::controller::Controller;

const REEMIT_PERIOD: Duration = Duration::from_secs(20);

const LONG: &str = "\
Continually resets the inverter output to a specific value, defaulting to \
zero, so that external watchdogs stay happy. This mode does not care about \
battery limits; specifically, it may discharge the battery below the \
boundary set by the BMS. The power level is from the point of view of the \
AC side (positive = inverter, negative = charger) and is distributed \
equally across all phases.";

pub static SPEC: ModeSpec = ModeSpec {
    name: "idle",
    summary: "Continuously set AC output to zero (or whatever).",
    params: &[("power", "The power output(+)/input(-) to set"), ("_l", LONG)],
    run,
};

fn run(ctrl: Arc<Controller>) -> BoxFuture<'static, Result<()>> {
    Box::pin(async move {
        info!(power_w = ctrl.op_f64_or("power", 0.0), "idling inverter");
        loop {
            let power = ctrl.op_f64_or("power", 0.0);
            if let Err(err) = ctrl.write_flat_setpoint(power).await {
                info!(error = %err, "skipping idle refresh");
            }
            tokio::time::sleep(REEMIT_PERIOD).await;
        }
    })
}
