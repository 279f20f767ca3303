//! In-memory bus used by the `sim` hardware mode and the test suite.
//!
//! Services are plain path→value maps. Every local mutation is mirrored onto
//! the update stream so the signal cache sees the same ordering it would see
//! against a live transport.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use super::{BusError, SignalBus, SignalUpdate, Value, WriteAck};
use crate::signals::paths;

const UPDATE_CHANNEL_CAPACITY: usize = 1024;

pub const SIM_SYSTEM: &str = "com.sim.system";
pub const SIM_BMS: &str = "com.sim.battery.socketcan_can0";
pub const SIM_VEBUS: &str = "com.sim.vebus.ttyO1";
pub const SIM_SOLAR: &str = "com.sim.solarcharger.ttyO2";

/// Seed a plausible hybrid installation: a 52 V pack mid-charge, a little
/// solar, balanced household loads. Used by the `sim` run mode and the
/// integration tests.
pub fn seed_demo_installation(bus: &SimBus, phases: usize) {
    bus.publish(SIM_SYSTEM, paths::NUM_PHASES, phases as i64);
    bus.publish(SIM_SYSTEM, paths::BATTERY_VOLTAGE, 52.1);
    bus.publish(SIM_SYSTEM, paths::BATTERY_CURRENT, 5.0);
    bus.publish(SIM_SYSTEM, paths::BATTERY_SOC, 55.0);
    bus.publish(SIM_SYSTEM, paths::PV_CURRENT, 12.0);
    bus.publish(SIM_SYSTEM, paths::VEBUS_CURRENT, -7.0);
    bus.publish(SIM_SYSTEM, paths::BATTERY_SERVICE, SIM_BMS);
    bus.publish(SIM_SYSTEM, paths::VEBUS_SERVICE, SIM_VEBUS);
    for i in 0..phases {
        bus.publish(SIM_SYSTEM, &paths::ac_in_power(i), 150.0);
        bus.publish(SIM_SYSTEM, &paths::grid_power(i), 120.0);
        bus.publish(SIM_SYSTEM, &paths::consumption(i), 210.0);
        bus.publish(SIM_SYSTEM, &paths::consumption_on_output(i), 0.0);
    }

    bus.publish(SIM_BMS, paths::BMS_LOW_VOLTAGE, 48.0);
    bus.publish(SIM_BMS, paths::BMS_MAX_CHARGE_VOLTAGE, 55.2);
    bus.publish(SIM_BMS, paths::BMS_MAX_CHARGE_CURRENT, 100.0);
    bus.publish(SIM_BMS, paths::BMS_MAX_DISCHARGE_CURRENT, 120.0);
    bus.publish(SIM_BMS, paths::BMS_ALLOW_CHARGE, true);
    bus.publish(SIM_BMS, paths::BMS_ALLOW_DISCHARGE, true);
    bus.publish(SIM_BMS, paths::BMS_CAPACITY, 200.0);

    bus.publish(SIM_VEBUS, paths::ACTIVE_IN_P_TOTAL, 90.0);
    for i in 0..phases {
        bus.publish(SIM_VEBUS, &paths::setpoint(i), 0.0);
        bus.publish(SIM_VEBUS, &paths::active_in_p(i), 30.0);
    }

    bus.publish(SIM_SOLAR, paths::YIELD_POWER, 480.0);
    bus.publish(SIM_SOLAR, paths::CUSTOM_NAME, "can0 : East Roof");
}

#[derive(Default)]
struct SimState {
    services: HashMap<String, HashMap<String, Option<Value>>>,
    read_only: HashSet<(String, String)>,
    names: HashSet<String>,
}

/// Simulated object bus.
#[derive(Clone)]
pub struct SimBus {
    state: Arc<RwLock<SimState>>,
    updates: broadcast::Sender<SignalUpdate>,
}

impl SimBus {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(RwLock::new(SimState::default())),
            updates,
        }
    }

    /// Create or update a path and notify subscribers.
    pub fn publish(&self, service: &str, path: &str, value: impl Into<Value>) {
        let value = value.into();
        self.state
            .write()
            .services
            .entry(service.to_string())
            .or_default()
            .insert(path.to_string(), Some(value.clone()));
        let _ = self.updates.send(SignalUpdate {
            service: service.to_string(),
            path: path.to_string(),
            value: Some(value),
        });
    }

    /// Mark a path read-only; writes to it return [`WriteAck::ReadOnly`].
    pub fn set_read_only(&self, service: &str, path: &str) {
        self.state
            .write()
            .read_only
            .insert((service.to_string(), path.to_string()));
    }

    /// Drop a whole service, pushing "absent" updates for each of its paths.
    pub fn disconnect_service(&self, service: &str) {
        let paths: Vec<String> = {
            let mut state = self.state.write();
            match state.services.remove(service) {
                Some(tree) => tree.into_keys().collect(),
                None => return,
            }
        };
        for path in paths {
            let _ = self.updates.send(SignalUpdate {
                service: service.to_string(),
                path,
                value: None,
            });
        }
    }

    /// Last value written to a path, if any.
    pub fn value(&self, service: &str, path: &str) -> Option<Value> {
        self.state
            .read()
            .services
            .get(service)
            .and_then(|tree| tree.get(path))
            .cloned()
            .flatten()
    }

    /// Names currently registered on the simulated bus.
    pub fn registered_names(&self) -> Vec<String> {
        self.state.read().names.iter().cloned().collect()
    }
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalBus for SimBus {
    async fn fetch_tree(&self, service: &str) -> Result<HashMap<String, Value>, BusError> {
        let state = self.state.read();
        let tree = state
            .services
            .get(service)
            .ok_or_else(|| BusError::NoService(service.to_string()))?;
        Ok(tree
            .iter()
            .filter_map(|(path, value)| value.clone().map(|v| (path.clone(), v)))
            .collect())
    }

    async fn read(&self, service: &str, path: &str) -> Result<Option<Value>, BusError> {
        let state = self.state.read();
        let tree = state
            .services
            .get(service)
            .ok_or_else(|| BusError::NoService(service.to_string()))?;
        match tree.get(path) {
            Some(value) => Ok(value.clone()),
            None => Err(BusError::NoPath {
                service: service.to_string(),
                path: path.to_string(),
            }),
        }
    }

    async fn write(&self, service: &str, path: &str, value: Value) -> Result<WriteAck, BusError> {
        {
            let state = self.state.read();
            if !state.services.contains_key(service) {
                return Err(BusError::NoService(service.to_string()));
            }
            if state
                .read_only
                .contains(&(service.to_string(), path.to_string()))
            {
                return Ok(WriteAck::ReadOnly);
            }
        }
        self.publish(service, path, value);
        Ok(WriteAck::Ok)
    }

    async fn services_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .read()
            .services
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn updates(&self) -> broadcast::Receiver<SignalUpdate> {
        self.updates.subscribe()
    }

    async fn register_name(&self, name: &str) -> Result<(), BusError> {
        self.state.write().names.insert(name.to_string());
        Ok(())
    }

    async fn release_name(&self, name: &str) -> Result<(), BusError> {
        self.state.write().names.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_read_write_roundtrip() {
        let bus = SimBus::new();
        bus.publish("com.sim.system", "/Dc/Battery/Voltage", 52.1);

        let tree = bus.fetch_tree("com.sim.system").await.unwrap();
        assert_eq!(tree.get("/Dc/Battery/Voltage"), Some(&Value::Float(52.1)));

        let ack = bus
            .write("com.sim.system", "/Dc/Battery/Voltage", Value::Float(53.0))
            .await
            .unwrap();
        assert_eq!(ack, WriteAck::Ok);
        assert_eq!(
            bus.read("com.sim.system", "/Dc/Battery/Voltage").await.unwrap(),
            Some(Value::Float(53.0))
        );
    }

    #[tokio::test]
    async fn read_only_paths_refuse_writes() {
        let bus = SimBus::new();
        bus.publish("com.sim.system", "/Dc/Battery/Soc", 55.0);
        bus.set_read_only("com.sim.system", "/Dc/Battery/Soc");

        let ack = bus
            .write("com.sim.system", "/Dc/Battery/Soc", Value::Float(1.0))
            .await
            .unwrap();
        assert_eq!(ack, WriteAck::ReadOnly);
    }

    #[tokio::test]
    async fn disconnect_pushes_absent_updates() {
        let bus = SimBus::new();
        bus.publish("com.sim.bms", "/Capacity", 200.0);
        let mut rx = bus.updates();

        bus.disconnect_service("com.sim.bms");
        let update = rx.recv().await.unwrap();
        assert_eq!(update.service, "com.sim.bms");
        assert!(update.value.is_none());
        assert!(bus.fetch_tree("com.sim.bms").await.is_err());
    }

    #[tokio::test]
    async fn service_listing_by_prefix() {
        let bus = SimBus::new();
        bus.publish("com.sim.solarcharger.a", "/Yield/Power", 100.0);
        bus.publish("com.sim.solarcharger.b", "/Yield/Power", 80.0);
        bus.publish("com.sim.system", "/Ac/ActiveIn/NumberOfPhases", 3i64);

        let solar = bus.services_with_prefix("com.sim.solarcharger").await;
        assert_eq!(solar.len(), 2);
    }
}
