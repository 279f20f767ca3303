//! Last-known-value cache over the object bus.
//!
//! Each tracked path owns a watch channel: `get` reads the current value
//! without blocking, `subscribe` hands out a receiver that wakes once per
//! update. A publisher disconnect stores `None` ("absent") and wakes
//! subscribers like any other change.

pub mod paths;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::{BusError, SignalBus, Value, WriteAck};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SignalId {
    pub service: String,
    pub path: String,
}

impl SignalId {
    pub fn new(service: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            path: path.into(),
        }
    }
}

struct Slot {
    tx: watch::Sender<Option<Value>>,
    updated: RwLock<Option<DateTime<Utc>>>,
}

impl Slot {
    fn new(value: Option<Value>) -> Self {
        let (tx, _) = watch::channel(value);
        Self {
            tx,
            updated: RwLock::new(None),
        }
    }
}

/// Shared cache of tracked signals.
#[derive(Clone)]
pub struct SignalCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    bus: Arc<dyn SignalBus>,
    slots: RwLock<HashMap<SignalId, Arc<Slot>>>,
}

impl SignalCache {
    pub fn new(bus: Arc<dyn SignalBus>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                bus,
                slots: RwLock::new(HashMap::new()),
            }),
        }
    }

    fn slot(&self, id: &SignalId) -> Arc<Slot> {
        if let Some(slot) = self.inner.slots.read().get(id) {
            return Arc::clone(slot);
        }
        let mut slots = self.inner.slots.write();
        Arc::clone(
            slots
                .entry(id.clone())
                .or_insert_with(|| Arc::new(Slot::new(None))),
        )
    }

    /// Track a set of paths on one service, seeding them from a single bulk
    /// tree fetch. Paths missing from the tree are queried individually; if
    /// that fails too they start out absent.
    pub async fn prime(&self, service: &str, paths: &[String]) {
        let tree = match self.inner.bus.fetch_tree(service).await {
            Ok(tree) => tree,
            Err(err) => {
                warn!(service, error = %err, "bulk fetch failed, falling back to single reads");
                HashMap::new()
            }
        };

        for path in paths {
            let value = match tree.get(path) {
                Some(v) => Some(v.clone()),
                None => match self.inner.bus.read(service, path).await {
                    Ok(v) => v,
                    Err(err) => {
                        debug!(service, path, error = %err, "signal starts absent");
                        None
                    }
                },
            };
            self.store(&SignalId::new(service, path.clone()), value);
        }
    }

    /// Current value; never blocks.
    pub fn get(&self, id: &SignalId) -> Option<Value> {
        self.inner
            .slots
            .read()
            .get(id)
            .and_then(|slot| slot.tx.borrow().clone())
    }

    /// Numeric view of [`Self::get`].
    pub fn get_f64(&self, id: &SignalId) -> Option<f64> {
        self.get(id).and_then(|v| v.as_f64())
    }

    /// Subscribe to updates of one signal. The receiver is woken once per
    /// update, including the transition to absent.
    pub fn subscribe(&self, id: &SignalId) -> watch::Receiver<Option<Value>> {
        self.slot(id).tx.subscribe()
    }

    /// When the signal last changed, if it ever did.
    pub fn updated_at(&self, id: &SignalId) -> Option<DateTime<Utc>> {
        self.inner
            .slots
            .read()
            .get(id)
            .and_then(|slot| *slot.updated.read())
    }

    /// Forward a write to the remote publisher.
    pub async fn write(&self, id: &SignalId, value: Value) -> Result<WriteAck, BusError> {
        self.inner.bus.write(&id.service, &id.path, value).await
    }

    fn store(&self, id: &SignalId, value: Option<Value>) {
        let slot = self.slot(id);
        *slot.updated.write() = Some(Utc::now());
        slot.tx.send_replace(value);
    }

    /// Start pumping bus change notifications into the tracked slots until
    /// cancelled. The bus stream is subscribed before this returns, so no
    /// update published afterwards can be missed. Updates for untracked paths
    /// are dropped.
    pub fn spawn_pump(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let updates = self.inner.bus.updates();
        let cache = self.clone();
        tokio::spawn(async move { cache.pump(updates, cancel).await })
    }

    async fn pump(self, mut updates: broadcast::Receiver<crate::bus::SignalUpdate>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                recv = updates.recv() => match recv {
                    Ok(update) => {
                        let id = SignalId::new(update.service, update.path);
                        let tracked = self.inner.slots.read().contains_key(&id);
                        if tracked {
                            self.store(&id, update.value);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "signal cache lagged behind the bus stream");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::sim::SimBus;

    const SYS: &str = "com.sim.system";

    fn cache_over(bus: &SimBus) -> SignalCache {
        SignalCache::new(Arc::new(bus.clone()))
    }

    #[tokio::test]
    async fn prime_seeds_from_bulk_fetch() {
        let bus = SimBus::new();
        bus.publish(SYS, paths::BATTERY_VOLTAGE, 52.0);
        bus.publish(SYS, paths::BATTERY_SOC, 70.0);

        let cache = cache_over(&bus);
        cache
            .prime(
                SYS,
                &[paths::BATTERY_VOLTAGE.to_string(), paths::BATTERY_SOC.to_string()],
            )
            .await;

        let id = SignalId::new(SYS, paths::BATTERY_VOLTAGE);
        assert_eq!(cache.get_f64(&id), Some(52.0));
        assert!(cache.updated_at(&id).is_some());
    }

    #[tokio::test]
    async fn missing_path_starts_absent() {
        let bus = SimBus::new();
        bus.publish(SYS, paths::BATTERY_VOLTAGE, 52.0);

        let cache = cache_over(&bus);
        cache.prime(SYS, &[paths::PV_CURRENT.to_string()]).await;

        assert_eq!(cache.get(&SignalId::new(SYS, paths::PV_CURRENT)), None);
    }

    #[tokio::test]
    async fn disconnect_marks_absent_and_wakes_subscribers() {
        let bus = SimBus::new();
        bus.publish(SYS, paths::PV_CURRENT, 12.0);

        let cache = cache_over(&bus);
        cache.prime(SYS, &[paths::PV_CURRENT.to_string()]).await;

        let cancel = CancellationToken::new();
        let pump = cache.spawn_pump(cancel.clone());

        let id = SignalId::new(SYS, paths::PV_CURRENT);
        let mut rx = cache.subscribe(&id);

        bus.disconnect_service(SYS);
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_none());
        assert_eq!(cache.get(&id), None);

        cancel.cancel();
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn untracked_updates_are_dropped() {
        let bus = SimBus::new();
        bus.publish(SYS, paths::BATTERY_VOLTAGE, 52.0);

        let cache = cache_over(&bus);
        let cancel = CancellationToken::new();
        let pump = cache.spawn_pump(cancel.clone());

        bus.publish(SYS, paths::BATTERY_SOC, 55.0);
        tokio::task::yield_now().await;
        assert_eq!(cache.get(&SignalId::new(SYS, paths::BATTERY_SOC)), None);

        cancel.cancel();
        pump.await.unwrap();
    }
}
