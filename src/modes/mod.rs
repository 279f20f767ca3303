//! Operating modes and the runner that hosts them.
//!
//! Exactly one mode task runs at a time. A switch aborts the running task,
//! waits for it to wind down, starts the replacement, and then holds the
//! settle window during which further switches are refused. Modes are known
//! at build time through a static registry.

mod analyze;
mod batt_current;
mod grid_power;
mod idle;
mod inv_power;
mod off;
mod remote;
mod soc;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::redistribute::redistribute;
use crate::controller::{Controller, CycleError, SETTLE_WINDOW};

/// Pause before retrying a cycle that could not run (absent telemetry).
pub(crate) const CYCLE_RETRY: Duration = Duration::from_secs(2);

/// One registered mode: identity, parameter documentation, entry point.
pub struct ModeSpec {
    pub name: &'static str,
    pub summary: &'static str,
    /// Recognised operator parameters with one-line docs; the `_l` entry
    /// carries the long description served by the control surface.
    pub params: &'static [(&'static str, &'static str)],
    pub run: fn(Arc<Controller>) -> BoxFuture<'static, Result<()>>,
}

/// All built-in modes. Order is what the control surface lists.
pub static MODES: &[&ModeSpec] = &[
    &off::SPEC,
    &idle::SPEC,
    &grid_power::SPEC,
    &inv_power::SPEC,
    &batt_current::SPEC,
    &soc::SPEC,
    &remote::SPEC,
    &analyze::SPEC,
];

pub fn find(name: &str) -> Option<&'static ModeSpec> {
    MODES.iter().copied().find(|spec| spec.name == name)
}

/// Emission wrapper owned by each mode task.
///
/// From the second emission on it runs the overload redistributor against
/// the observed inverter response before writing, then waits for the
/// telemetry round-trip so the next decision sees settled values.
pub struct Emitter {
    running: bool,
}

impl Emitter {
    pub fn new() -> Self {
        Self { running: false }
    }

    pub async fn set_inv_ps(&mut self, ctrl: &Controller, ps: Vec<f64>) -> Result<(), CycleError> {
        let n = ctrl.n_phase();
        if n == 0 {
            return Ok(());
        }

        let mut ps = ps;
        if self.running && n > 1 {
            if let Some(observed) = ctrl.phase_observations() {
                // the redistributor works in the wire sign convention
                let wire: Vec<f64> = ps.iter().map(|v| -v).collect();
                let adjusted = {
                    let mut limits = ctrl.phase_limits().lock();
                    redistribute(&wire, &observed, &mut limits)
                };
                ps = adjusted.into_iter().map(|v| -v).collect();
            }
        }

        ctrl.write_setpoints(&ps).await?;
        ctrl.wait_converged().await?;
        self.running = true;
        Ok(())
    }
}

impl Default for Emitter {
    fn default() -> Self {
        Self::new()
    }
}

/// Host the active mode task until the controller is shut down.
///
/// Every mode start, including the initial one, is followed by the settle
/// window; switch requests only get through once it has elapsed.
pub async fn run_mode_loop(ctrl: Arc<Controller>, cancel: CancellationToken) -> Result<()> {
    let mut requests = ctrl.subscribe_mode_requests();
    loop {
        let name = ctrl.current_mode();
        let Some(spec) = find(&name) else {
            bail!("startup mode is not registered: {name}");
        };

        ctrl.on_mode_start(spec.name);
        info!(mode = %spec.name, "mode task starting");
        let handle = tokio::spawn((spec.run)(Arc::clone(&ctrl)));

        ctrl.set_settle_open(false);
        tokio::select! {
            _ = cancel.cancelled() => {
                stop_task(handle).await;
                return Ok(());
            }
            _ = tokio::time::sleep(SETTLE_WINDOW) => {}
        }
        ctrl.set_settle_open(true);

        tokio::select! {
            _ = cancel.cancelled() => {
                stop_task(handle).await;
                return Ok(());
            }
            changed = requests.changed() => {
                stop_task(handle).await;
                if changed.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

async fn stop_task(handle: JoinHandle<Result<()>>) {
    handle.abort();
    match handle.await {
        Ok(Ok(())) => debug!("mode task finished"),
        Ok(Err(err)) => warn!(error = %err, "mode task ended with error"),
        Err(join) if join.is_cancelled() => debug!("mode task cancelled"),
        Err(join) => warn!(error = %join, "mode task panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_knows_the_documented_modes() {
        let names: Vec<&str> = MODES.iter().map(|m| m.name).collect();
        assert_eq!(
            names,
            ["off", "idle", "p_grid", "p_inv", "i_batt", "soc", "remote", "analyze"]
        );
        assert!(find("p_grid").is_some());
        assert!(find("warp_drive").is_none());
    }

    #[test]
    fn every_mode_documents_its_parameters() {
        for spec in MODES {
            assert!(!spec.summary.is_empty(), "{} lacks a summary", spec.name);
            assert!(
                spec.params.iter().any(|(k, _)| *k == "_l"),
                "{} lacks a long description",
                spec.name
            );
        }
    }
}
