//! Battery-management-system client boundary.
//!
//! The capacity-analysis mode needs more than the telemetry paths: cell
//! voltage extremes, resettable charge/discharge work counters, the cell
//! voltage configuration, and the ability to program a calibrated capacity.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Lowest and highest cell voltage across a battery.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CellRange {
    pub min_cell: f64,
    pub max_cell: f64,
}

/// Accumulated charge/discharge energy (Ws) since the last clear.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WorkCounters {
    pub chg: f64,
    pub dis: f64,
}

/// Cell voltage windows: `u_lim_*` is the working window, `u_ext_*` the
/// absolute one. `balance_delta` is the acceptable cell spread.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CellConfig {
    pub u_lim_min: f64,
    pub u_lim_max: f64,
    pub u_ext_min: f64,
    pub u_ext_max: f64,
    pub balance_delta: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BmsConfig {
    pub cell: CellConfig,
}

#[async_trait]
pub trait BmsClient: Send + Sync {
    /// Work counters per battery; `clear` resets them after reading.
    async fn work(&self, poll: bool, clear: bool) -> Result<Vec<WorkCounters>>;

    /// Cell voltage extremes per battery.
    async fn voltages(&self) -> Result<Vec<CellRange>>;

    async fn config(&self) -> Result<BmsConfig>;

    /// Program a calibrated capacity (Ws) and loss factor.
    async fn set_capacity(&self, index: usize, capacity: f64, loss: f64, top: bool) -> Result<()>;
}

/// Scriptable BMS used by the `sim` mode and the test suite.
///
/// Voltage readings and work counters are played back from queues; the last
/// entry repeats once a queue runs dry, so steady states are easy to model.
pub struct SimBms {
    config: BmsConfig,
    voltages: Mutex<VecDeque<CellRange>>,
    last_voltage: Mutex<CellRange>,
    work: Mutex<VecDeque<WorkCounters>>,
    capacity_calls: Mutex<Vec<(usize, f64, f64, bool)>>,
}

impl SimBms {
    pub fn new(config: BmsConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            voltages: Mutex::new(VecDeque::new()),
            last_voltage: Mutex::new(CellRange {
                min_cell: (config.cell.u_lim_min + config.cell.u_lim_max) / 2.0,
                max_cell: (config.cell.u_lim_min + config.cell.u_lim_max) / 2.0,
            }),
            work: Mutex::new(VecDeque::new()),
            capacity_calls: Mutex::new(Vec::new()),
        })
    }

    /// A plausible 16-cell LiFePO4 pack.
    pub fn lifepo4() -> Arc<Self> {
        Self::new(BmsConfig {
            cell: CellConfig {
                u_lim_min: 3.0,
                u_lim_max: 3.45,
                u_ext_min: 2.8,
                u_ext_max: 3.6,
                balance_delta: 0.01,
            },
        })
    }

    /// Queue cell readings; each `voltages()` call consumes one.
    pub fn script_voltages(&self, readings: impl IntoIterator<Item = (f64, f64)>) {
        let mut queue = self.voltages.lock();
        for (min_cell, max_cell) in readings {
            queue.push_back(CellRange { min_cell, max_cell });
        }
    }

    /// Queue work-counter readings; each clearing `work()` call consumes one.
    pub fn script_work(&self, counters: impl IntoIterator<Item = (f64, f64)>) {
        let mut queue = self.work.lock();
        for (chg, dis) in counters {
            queue.push_back(WorkCounters { chg, dis });
        }
    }

    /// Capacity programming calls recorded so far.
    pub fn programmed(&self) -> Vec<(usize, f64, f64, bool)> {
        self.capacity_calls.lock().clone()
    }
}

#[async_trait]
impl BmsClient for SimBms {
    async fn work(&self, _poll: bool, clear: bool) -> Result<Vec<WorkCounters>> {
        let mut queue = self.work.lock();
        let current = queue.front().copied().unwrap_or_default();
        if clear && queue.len() > 1 {
            queue.pop_front();
        }
        Ok(vec![current])
    }

    async fn voltages(&self) -> Result<Vec<CellRange>> {
        let mut queue = self.voltages.lock();
        let reading = match queue.pop_front() {
            Some(r) => {
                *self.last_voltage.lock() = r;
                r
            }
            None => *self.last_voltage.lock(),
        };
        Ok(vec![reading])
    }

    async fn config(&self) -> Result<BmsConfig> {
        Ok(self.config)
    }

    async fn set_capacity(&self, index: usize, capacity: f64, loss: f64, top: bool) -> Result<()> {
        info!(index, capacity_ws = capacity, loss, top, "sim BMS capacity programmed");
        self.capacity_calls.lock().push((index, capacity, loss, top));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_voltages_play_back_and_repeat() {
        let bms = SimBms::lifepo4();
        bms.script_voltages([(3.1, 3.2), (3.3, 3.35)]);

        assert_eq!(bms.voltages().await.unwrap()[0].min_cell, 3.1);
        assert_eq!(bms.voltages().await.unwrap()[0].min_cell, 3.3);
        // queue dry: the last reading repeats
        assert_eq!(bms.voltages().await.unwrap()[0].min_cell, 3.3);
    }

    #[tokio::test]
    async fn clearing_work_advances_the_script() {
        let bms = SimBms::lifepo4();
        bms.script_work([(0.0, 0.0), (200.0, 9500.0)]);

        let first = bms.work(true, true).await.unwrap()[0];
        assert_eq!(first.chg, 0.0);
        let second = bms.work(true, true).await.unwrap()[0];
        assert_eq!(second.dis, 9500.0);
        // last entry is retained
        let third = bms.work(true, false).await.unwrap()[0];
        assert_eq!(third.chg, 200.0);
    }
}
