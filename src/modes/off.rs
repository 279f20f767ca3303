use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use tracing::info;

use super::{ModeSpec, CYCLE_RETRY};
use crate::controller::Controller;

const LONG: &str = "\
Sets the inverter power to a specific value, defaulting to zero, and then \
does nothing. Use this to move the controller out of the way temporarily, \
e.g. while testing some other program. The power level is from the point of \
view of the AC side: positive = inverter, negative = charger.";

pub static SPEC: ModeSpec = ModeSpec {
    name: "off",
    summary: "Set the AC output to zero, then do nothing.",
    params: &[("power", "The power output(+)/input(-) to set"), ("_l", LONG)],
    run,
};

fn run(ctrl: Arc<Controller>) -> BoxFuture<'static, Result<()>> {
    Box::pin(async move {
        let power = ctrl.op_f64_or("power", 0.0);
        info!(power_w = power, "parking inverter");
        // ignores battery limits on purpose: this is the manual shutoff
        while let Err(err) = ctrl.write_flat_setpoint(power).await {
            info!(error = %err, "cannot park inverter yet");
            tokio::time::sleep(CYCLE_RETRY).await;
        }
        std::future::pending::<Result<()>>().await
    })
}
