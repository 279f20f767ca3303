//! Solar yield logger.
//!
//! Sums the yield of every solar-charger service once per second, keeps the
//! controller's live solar power current, and publishes totals to the
//! external KV store: per-charger and total power every ten seconds, the
//! accumulated energy every fifteen minutes.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bus::SignalBus;
use crate::controller::Controller;
use crate::distkv::DistStore;
use crate::signals::paths;

const PUBLISH_EVERY_S: u64 = 10;
const ENERGY_EVERY_S: u64 = 900;

pub async fn solar_log(ctrl: Arc<Controller>, store: Arc<dyn DistStore>, cancel: CancellationToken) {
    let root = ctrl
        .config()
        .distkv
        .as_ref()
        .map(|d| d.root.clone())
        .unwrap_or_else(|| "solar".to_string());

    // resume the lifetime energy counter where the last run left off
    let mut energy_ws = match store.get(&format!("{root}/energy")).await {
        Ok(Some(v)) => v.as_f64().unwrap_or(0.0) * 3600.0,
        _ => 0.0,
    };
    let _ = store.set(&format!("{root}/online"), json!(true)).await;
    info!(energy_wh = energy_ws / 3600.0, "solar logger started");

    let prefix = ctrl.solar_service_prefix();
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut tick: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        tick += 1;

        let chargers = ctrl.bus().services_with_prefix(&prefix).await;
        let mut cur_p = 0.0;
        let mut per_charger = Vec::with_capacity(chargers.len());
        for service in &chargers {
            let p = match ctrl.bus().read(service, paths::YIELD_POWER).await {
                Ok(Some(v)) => v.as_f64().unwrap_or(0.0),
                _ => 0.0,
            };
            cur_p += p;
            per_charger.push((service.clone(), p));
        }
        energy_ws += cur_p; // one second per tick
        ctrl.set_solar_p(cur_p);

        if tick % PUBLISH_EVERY_S == 0 {
            for (service, p) in &per_charger {
                let name = charger_name(&ctrl, service).await;
                let _ = store.set(&format!("{root}/p/{name}"), json!(p)).await;
            }
            let _ = store.set(&format!("{root}/p"), json!(cur_p)).await;
            let _ = store.set(&format!("{root}/grid"), json!(ctrl.p_grid_total())).await;
            if let Ok(soc) = ctrl.soc() {
                let _ = store.set(&format!("{root}/batt_pct"), json!(soc)).await;
            }
            let (i_pv, i_pv_max, pv_margin) = ctrl.pv_snapshot();
            let _ = store.set(&format!("{root}/cur"), json!(i_pv)).await;
            let _ = store.set(&format!("{root}/max"), json!(i_pv_max)).await;
            let _ = store.set(&format!("{root}/ref"), json!(pv_margin)).await;
            debug!(solar_w = cur_p, "solar snapshot published");
        }

        if tick % ENERGY_EVERY_S == 0 {
            let _ = store
                .set(&format!("{root}/energy"), json!(energy_ws / 3600.0))
                .await;
        }
    }

    let _ = store
        .set(&format!("{root}/energy"), json!(energy_ws / 3600.0))
        .await;
    let _ = store.set(&format!("{root}/online"), json!(false)).await;
}

/// Display name of a charger: its custom name with any "<bus> : " prefix
/// stripped, falling back to the last service-name segment.
async fn charger_name(ctrl: &Controller, service: &str) -> String {
    if let Ok(Some(v)) = ctrl.bus().read(service, paths::CUSTOM_NAME).await {
        if let Some(name) = v.as_text() {
            return match name.find(" : ") {
                Some(i) => name[i + 3..].to_string(),
                None => name.to_string(),
            };
        }
    }
    service.rsplit('.').next().unwrap_or(service).to_string()
}
