use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use open_inverter_controller::bms::{self, BmsClient};
use open_inverter_controller::bus::{self, SignalBus};
use open_inverter_controller::config::AppConfig;
use open_inverter_controller::controller::Controller;
use open_inverter_controller::distkv::{DistStore, MemoryStore};
use open_inverter_controller::platform::PlatformInfo;
use open_inverter_controller::telemetry::{self, init_tracing};
use open_inverter_controller::api;

#[cfg(not(feature = "sim"))]
compile_error!("an object-bus transport is required; build with the `sim` feature");

// The whole core is cooperative: one thread, suspension only at awaits.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cfg = AppConfig::load()?;
    let platform = PlatformInfo::get();
    info!(
        name = %cfg.name,
        machine = ?platform.machine_id,
        portal = ?platform.portal_id,
        fake = cfg.op.fake,
        "starting inverter controller"
    );

    let sim = bus::sim::SimBus::new();
    bus::sim::seed_demo_installation(&sim, 3);
    let bus: Arc<dyn SignalBus> = Arc::new(sim);
    let bms: Arc<dyn BmsClient> = bms::SimBms::lifepo4();
    let store: Option<Arc<dyn DistStore>> = cfg.distkv.as_ref().map(|_| {
        let store: Arc<dyn DistStore> = MemoryStore::new();
        store
    });

    let controller = Controller::new(cfg.clone(), bus, bms, store, bus::sim::SIM_SYSTEM);

    let cancel = CancellationToken::new();
    let ctrl_task = tokio::spawn(Arc::clone(&controller).run(cancel.clone()));

    let app = api::router(Arc::clone(&controller));
    let addr = cfg.server.socket_addr()?;
    info!(%addr, "control surface listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(telemetry::shutdown_signal(cancel.clone()))
        .await?;

    // shutdown_signal tripped the token; wait for the active phase to unwind
    match ctrl_task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(error = %err, "controller exited with error"),
        Err(err) => warn!(error = %err, "controller task join failed"),
    }
    info!("shutdown complete");
    Ok(())
}
