//! The inverter controller: long-lived state, live-input assembly, the
//! decision path from a requested power to an emitted per-phase setpoint
//! vector, and the activation scope that owns all periodic tasks.

pub mod averaging;
pub mod damper;
pub mod limits;
pub mod phases;
pub mod redistribute;
pub mod snapshot;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::bms::BmsClient;
use crate::bus::{SignalBus, Value, WriteAck};
use crate::config::AppConfig;
use crate::distkv::DistStore;
use crate::signals::{paths, SignalCache, SignalId};

use averaging::{CurrentWindow, PvTracker, BATT_AVG_PERIOD, PV_TRACK_PERIOD};
use damper::{Damper, DamperConfig};
use limits::{decide, p_from_i, LimitConfig, LimitInputs};
use redistribute::PhaseLimits;
use snapshot::{DecisionSnapshot, DiagState};

/// Settling delay after every mode start before another switch is accepted.
pub const SETTLE_WINDOW: Duration = Duration::from_secs(30);
/// Grace before watching for a telemetry round-trip after an emission.
const TRIGGER_SLEEP: Duration = Duration::from_secs(3);
/// Upper bound for one telemetry wait.
const TRIGGER_TIMEOUT: Duration = Duration::from_secs(5);
/// Upper bound on convergence polls after an emission.
const CONVERGE_POLLS: u32 = 10;
/// Deadline for releasing the bus name during shutdown.
const NAME_RELEASE_DEADLINE: Duration = Duration::from_secs(2);

/// A cycle could not produce a setpoint; the periodic loop retries later.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("signal absent: {0}")]
    Absent(String),

    #[error("controller not activated")]
    NotActive,
}

/// Mode switching failed; surfaced through the control surface.
#[derive(Debug, Error)]
pub enum ModeError {
    #[error("mode switch within the settling window, try again later")]
    TooEarly,

    #[error("unknown mode: {0}")]
    UnknownMode(String),

    #[error("unknown parameter for {mode}: {param}")]
    UnknownParam { mode: String, param: String },
}

/// Services and sizes discovered from the live system at activation.
#[derive(Debug, Clone)]
struct Topology {
    n_phase: usize,
    bms_service: String,
    vebus_service: String,
    b_cap: f64,
}

struct ModeState {
    current: Mutex<String>,
    pending: watch::Sender<String>,
    settle_open: AtomicBool,
}

pub struct Controller {
    cfg: AppConfig,
    damper_cfg: DamperConfig,
    pub cache: SignalCache,
    bus: Arc<dyn SignalBus>,
    pub bms: Arc<dyn BmsClient>,
    pub store: Option<Arc<dyn DistStore>>,
    system_service: String,

    topo: RwLock<Option<Topology>>,
    batt_window: Mutex<CurrentWindow>,
    i_batt_avg: RwLock<f64>,
    pv: Mutex<PvTracker>,
    damper: Mutex<Damper>,
    phase_limits: Mutex<PhaseLimits>,
    op: RwLock<BTreeMap<String, serde_json::Value>>,
    diag: Mutex<DiagState>,
    solar_p: RwLock<f64>,
    top_off: AtomicBool,
    mode: ModeState,
}

impl Controller {
    pub fn new(
        cfg: AppConfig,
        bus: Arc<dyn SignalBus>,
        bms: Arc<dyn BmsClient>,
        store: Option<Arc<dyn DistStore>>,
        system_service: impl Into<String>,
    ) -> Arc<Self> {
        let default_mode = cfg.modes.default.clone();
        let mut op = BTreeMap::new();
        for (k, v) in cfg.mode_defaults(&default_mode) {
            op.insert(k, v);
        }
        let (pending, _) = watch::channel(default_mode.clone());
        Arc::new(Self {
            damper_cfg: DamperConfig::from(&cfg.system),
            cache: SignalCache::new(Arc::clone(&bus)),
            bus,
            bms,
            store,
            system_service: system_service.into(),
            topo: RwLock::new(None),
            batt_window: Mutex::new(CurrentWindow::new()),
            i_batt_avg: RwLock::new(0.0),
            pv: Mutex::new(PvTracker::new(cfg.system.pv_margin, cfg.system.pv_shrink_min)),
            damper: Mutex::new(Damper::seeded(0.0)),
            phase_limits: Mutex::new(PhaseLimits::unknown(0)),
            op: RwLock::new(op),
            diag: Mutex::new(DiagState::default()),
            solar_p: RwLock::new(0.0),
            top_off: AtomicBool::new(cfg.system.top_off),
            mode: ModeState {
                current: Mutex::new(default_mode),
                pending,
                settle_open: AtomicBool::new(true),
            },
            cfg,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.cfg
    }

    pub fn bus(&self) -> &Arc<dyn SignalBus> {
        &self.bus
    }

    /// Service-name prefix the solar chargers live under, derived from the
    /// system service's namespace.
    pub fn solar_service_prefix(&self) -> String {
        match self.system_service.strip_suffix(".system") {
            Some(base) => format!("{base}.solarcharger"),
            None => "solarcharger".to_string(),
        }
    }

    /// Current PV current, the decaying maximum and the drop margin.
    pub fn pv_snapshot(&self) -> (f64, f64, f64) {
        let pv = self.pv.lock();
        (self.i_pv().unwrap_or(0.0), pv.i_pv_max, pv.pv_margin)
    }

    // ---- live values ---------------------------------------------------

    fn sys(&self, path: &str) -> SignalId {
        SignalId::new(&self.system_service, path)
    }

    fn required(&self, id: &SignalId) -> Result<f64, CycleError> {
        self.cache
            .get_f64(id)
            .ok_or_else(|| CycleError::Absent(format!("{}{}", id.service, id.path)))
    }

    fn topology(&self) -> Result<Topology, CycleError> {
        self.topo.read().clone().ok_or(CycleError::NotActive)
    }

    pub fn n_phase(&self) -> usize {
        self.topo.read().as_ref().map_or(0, |t| t.n_phase)
    }

    /// Battery current at the bus bar; positive = battery feeding the bus.
    pub fn i_batt(&self) -> Result<f64, CycleError> {
        Ok(-self.required(&self.sys(paths::BATTERY_CURRENT))?)
    }

    /// Battery voltage corrected for the pack's internal resistance.
    pub fn u_dc(&self) -> Result<f64, CycleError> {
        let measured = self.required(&self.sys(paths::BATTERY_VOLTAGE))?;
        Ok(measured + self.i_batt()? * self.cfg.system.r_int)
    }

    pub fn i_pv(&self) -> Result<f64, CycleError> {
        self.required(&self.sys(paths::PV_CURRENT))
    }

    /// State of charge as a fraction in [0, 1].
    pub fn soc(&self) -> Result<f64, CycleError> {
        Ok(self.required(&self.sys(paths::BATTERY_SOC))? / 100.0)
    }

    fn cons_bus(&self, phase: usize) -> f64 {
        self.cache
            .get_f64(&self.sys(&paths::consumption(phase)))
            .unwrap_or(0.0)
    }

    fn crit_bus(&self, phase: usize) -> f64 {
        self.cache
            .get_f64(&self.sys(&paths::consumption_on_output(phase)))
            .unwrap_or(0.0)
    }

    /// Total measured consumption between inverter and grid meter (W, positive).
    pub fn p_cons_total(&self) -> f64 {
        (0..self.n_phase()).map(|i| self.cons_bus(i)).sum()
    }

    /// Net grid power as measured (W, positive = import).
    pub fn p_grid_total(&self) -> f64 {
        (0..self.n_phase())
            .map(|i| {
                self.cache
                    .get_f64(&self.sys(&paths::grid_power(i)))
                    .unwrap_or(0.0)
            })
            .sum()
    }

    /// AC power the inverter currently provides, derived from the
    /// consumption/grid balance.
    pub fn p_inv_observed(&self) -> f64 {
        self.p_cons_total() - self.p_grid_total()
    }

    /// Most recent total solar yield (W), maintained by the solar logger.
    pub fn solar_p(&self) -> f64 {
        *self.solar_p.read()
    }

    pub(crate) fn set_solar_p(&self, p: f64) {
        *self.solar_p.write() = p;
    }

    fn bms_signal(&self, path: &str) -> Result<SignalId, CycleError> {
        let topo = self.topology()?;
        Ok(SignalId::new(topo.bms_service, path))
    }

    /// Max discharge current; collapses to zero when the BMS disallows it.
    pub fn ib_max(&self) -> Result<f64, CycleError> {
        let allow = self
            .cache
            .get(&self.bms_signal(paths::BMS_ALLOW_DISCHARGE)?)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !allow {
            return Ok(0.0);
        }
        self.required(&self.bms_signal(paths::BMS_MAX_DISCHARGE_CURRENT)?)
    }

    /// Max charge current, negative at the bus bar; zero when disallowed.
    pub fn ib_min(&self) -> Result<f64, CycleError> {
        let allow = self
            .cache
            .get(&self.bms_signal(paths::BMS_ALLOW_CHARGE)?)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !allow {
            return Ok(0.0);
        }
        Ok(-self.required(&self.bms_signal(paths::BMS_MAX_CHARGE_CURRENT)?)?)
    }

    pub(crate) fn set_top_off(&self, on: bool) {
        self.top_off.store(on, Ordering::Relaxed);
    }

    pub(crate) fn restore_top_off(&self) {
        self.top_off
            .store(self.cfg.system.top_off, Ordering::Relaxed);
    }

    fn limit_cfg(&self) -> LimitConfig {
        let mut cfg = LimitConfig::from(&self.cfg.system);
        cfg.top_off = self.top_off.load(Ordering::Relaxed);
        cfg
    }

    fn limit_inputs(&self, p_req: f64, excess: Option<f64>) -> Result<LimitInputs, CycleError> {
        let pv = self.pv.lock();
        Ok(LimitInputs {
            p_req,
            excess,
            u_dc: self.u_dc()?,
            i_pv: self.i_pv()?,
            i_pv_max: pv.i_pv_max,
            pv_margin: pv.pv_margin,
            ib_min: self.ib_min()?,
            ib_max: self.ib_max()?,
            u_min: self.required(&self.bms_signal(paths::BMS_LOW_VOLTAGE)?)?,
            u_max: self.required(&self.bms_signal(paths::BMS_MAX_CHARGE_VOLTAGE)?)?,
            b_cap: self.topology()?.b_cap,
        })
    }

    // ---- the decision path ---------------------------------------------

    /// Turn a requested inverter power into a per-phase setpoint vector.
    ///
    /// `phase` (1-based) pins the whole setpoint onto one phase instead of
    /// distributing it by load.
    pub fn calc_inv_p(
        &self,
        p_req: f64,
        excess: Option<f64>,
        phase: Option<usize>,
    ) -> Result<Vec<f64>, CycleError> {
        let topo = self.topology()?;
        let n = topo.n_phase;
        if n == 0 {
            return Ok(Vec::new());
        }

        let inputs = self.limit_inputs(p_req, excess)?;
        let decision = decide(&self.limit_cfg(), &inputs);
        if decision.hard_clamped {
            error!(
                p_req,
                p = decision.p,
                "battery limit clamp engaged after all rules; an earlier rule missed this case"
            );
        }

        let soc = self.soc()?;
        let (np, damped) = self.damper.lock().apply(&self.damper_cfg, decision.p, soc);

        let ps = if phase.is_none() && n > 1 {
            let loads: Vec<f64> = (0..n).map(|i| -self.cons_bus(i)).collect();
            phases::distribute(np, &loads, self.cfg.system.p_per_phase)
        } else {
            let mut ps = vec![0.0; n];
            let idx = phase.map_or(0, |p| p.saturating_sub(1).min(n - 1));
            ps[idx] = np;
            ps
        };

        // what the inverter must move on its AC input, net of critical loads
        // wired to its output
        let out: Vec<f64> = ps
            .iter()
            .enumerate()
            .map(|(i, &v)| v - self.crit_bus(i))
            .collect();

        self.diag.lock().set(
            "inverter",
            DecisionSnapshot {
                limits: decision.traces,
                init: p_req,
                dest: decision.p,
                setpoint: np,
                damped,
                inv_phases: ps,
                phases: out.clone(),
                at: chrono::Utc::now(),
            },
        );

        Ok(out)
    }

    /// Hold the net grid flow at `power` watts (positive = import).
    pub fn calc_grid_p(&self, power: f64, excess: Option<f64>) -> Result<Vec<f64>, CycleError> {
        // p_cons + p_grid + p_inv == 0 by construction
        let p = self.p_cons_total() - power;
        self.calc_inv_p(p, excess, None)
    }

    /// Target a DC current through the inverter.
    pub fn calc_inv_i(&self, i: f64) -> Result<Vec<f64>, CycleError> {
        let p = p_from_i(i, self.u_dc()?, self.cfg.system.inv_eff, false);
        self.calc_inv_p(p, None, None)
    }

    /// Hold the battery current at `i` amps (positive = discharge).
    pub fn calc_batt_i(&self, i: f64) -> Result<Vec<f64>, CycleError> {
        let ii = i.clamp(self.ib_min()?, self.ib_max()?);
        if ii != i {
            debug!(wanted = i, clamped = ii, "battery current request clamped");
        }
        // i_pv + i_batt + i_inv == 0
        self.calc_inv_i(-ii - self.i_pv()?)
    }

    // ---- emission ------------------------------------------------------

    /// Write a setpoint vector to the inverter aggregator.
    ///
    /// The wire convention is inverted (negative = feed to AC), so values are
    /// negated on the way out. In fake mode nothing is written.
    pub async fn write_setpoints(&self, ps: &[f64]) -> Result<(), CycleError> {
        let topo = self.topology()?;
        if topo.n_phase == 0 {
            return Ok(());
        }

        let total: f64 = ps.iter().sum();
        if self.cfg.op.fake {
            info!(total_w = total, phases = ?ps, "fake mode, setpoint not written");
            return Ok(());
        }
        info!(total_w = total, phases = ?ps, "set inverter");

        for (i, &v) in ps.iter().enumerate().take(topo.n_phase) {
            let id = SignalId::new(topo.vebus_service.clone(), paths::setpoint(i));
            match self.cache.write(&id, Value::Float(-v)).await {
                Ok(WriteAck::Ok) => {}
                Ok(ack) => warn!(phase = i + 1, ?ack, "setpoint write refused"),
                Err(err) => warn!(phase = i + 1, error = %err, "setpoint write failed"),
            }
        }
        Ok(())
    }

    /// Emit the same power on every phase, bypassing the decision path.
    /// Used by the manual shutoff modes.
    pub async fn write_flat_setpoint(&self, power: f64) -> Result<(), CycleError> {
        let n = self.topology()?.n_phase;
        if n == 0 {
            return Ok(());
        }
        let ps = vec![power / n as f64; n];
        self.write_setpoints(&ps).await
    }

    /// Wire-signed view of the previously written setpoint and the observed
    /// running power per phase, for the overload redistributor. `None` until
    /// both are known for every phase.
    pub fn phase_observations(&self) -> Option<Vec<redistribute::PhaseObservation>> {
        let topo = self.topo.read().clone()?;
        let mut out = Vec::with_capacity(topo.n_phase);
        for i in 0..topo.n_phase {
            let p_set = self
                .cache
                .get_f64(&SignalId::new(topo.vebus_service.clone(), paths::setpoint(i)))?;
            let p_run = self
                .cache
                .get_f64(&SignalId::new(topo.vebus_service.clone(), paths::active_in_p(i)))?;
            out.push(redistribute::PhaseObservation { p_set, p_run });
        }
        Some(out)
    }

    pub fn phase_limits(&self) -> &Mutex<PhaseLimits> {
        &self.phase_limits
    }

    /// Wait for the next telemetry round-trip: a short grace period, then up
    /// to [`TRIGGER_TIMEOUT`] for the inverter aggregate power to report in.
    pub async fn trigger(&self) -> Result<(), CycleError> {
        let topo = self.topology()?;
        let id = SignalId::new(topo.vebus_service, paths::ACTIVE_IN_P_TOTAL);
        let mut rx = self.cache.subscribe(&id);
        tokio::time::sleep(TRIGGER_SLEEP).await;
        let _ = tokio::time::timeout(TRIGGER_TIMEOUT, rx.changed()).await;
        Ok(())
    }

    /// Poll after an emission until the observed inverter power settles:
    /// two consecutive samples closer than `p_step`, at most
    /// [`CONVERGE_POLLS`] rounds.
    pub async fn wait_converged(&self) -> Result<(), CycleError> {
        let mut p = self.p_inv_observed();
        self.trigger().await?;
        let mut stable = false;
        for _ in 0..CONVERGE_POLLS {
            self.trigger().await?;
            let pp = self.p_inv_observed();
            debug!(p_inv = pp, "convergence poll");
            if (pp - p).abs() < self.cfg.system.p_step {
                if stable {
                    break;
                }
                stable = true;
            } else {
                stable = false;
            }
            p = pp;
        }
        Ok(())
    }

    // ---- operator parameters and mode switching ------------------------

    pub fn current_mode(&self) -> String {
        self.mode.current.lock().clone()
    }

    pub fn subscribe_mode_requests(&self) -> watch::Receiver<String> {
        self.mode.pending.subscribe()
    }

    pub(crate) fn set_settle_open(&self, open: bool) {
        self.mode.settle_open.store(open, Ordering::Relaxed);
    }

    /// Switch modes (or update the running mode's parameters when `mode` is
    /// the current one). Submitted parameters override, config defaults fill.
    pub fn change_mode(
        &self,
        mode: &str,
        params: BTreeMap<String, serde_json::Value>,
    ) -> Result<(), ModeError> {
        if self.current_mode() != mode {
            if !self.mode.settle_open.load(Ordering::Relaxed) {
                return Err(ModeError::TooEarly);
            }
            if crate::modes::find(mode).is_none() {
                return Err(ModeError::UnknownMode(mode.to_string()));
            }
            *self.mode.current.lock() = mode.to_string();
            let _ = self.mode.pending.send(mode.to_string());
        }

        let mut op = self.op.write();
        for (k, v) in params {
            op.insert(k, v);
        }
        for (k, v) in self.cfg.mode_defaults(&self.current_mode()) {
            op.entry(k).or_insert(v);
        }
        Ok(())
    }

    /// Update one parameter of the running mode; the key must be documented
    /// by that mode.
    pub fn change_mode_param(
        &self,
        param: &str,
        value: serde_json::Value,
    ) -> Result<(), ModeError> {
        let mode = self.current_mode();
        let known = crate::modes::find(&mode)
            .map(|spec| spec.params.iter().any(|(k, _)| *k == param))
            .unwrap_or(false);
        if param.is_empty() || param.starts_with('_') || !known {
            return Err(ModeError::UnknownParam {
                mode,
                param: param.to_string(),
            });
        }
        self.op.write().insert(param.to_string(), value);
        Ok(())
    }

    pub fn op_value(&self, key: &str) -> Option<serde_json::Value> {
        self.op.read().get(key).cloned()
    }

    pub fn op_f64(&self, key: &str) -> Option<f64> {
        self.op_value(key).and_then(|v| v.as_f64())
    }

    pub fn op_f64_or(&self, key: &str, default: f64) -> f64 {
        self.op_f64(key).unwrap_or(default)
    }

    pub fn op_bool_or(&self, key: &str, default: bool) -> bool {
        self.op_value(key)
            .and_then(|v| match v {
                serde_json::Value::Bool(b) => Some(b),
                serde_json::Value::Number(n) => n.as_f64().map(|f| f != 0.0),
                _ => None,
            })
            .unwrap_or(default)
    }

    /// The optional `excess` parameter: -1 means unlimited (no cap).
    pub fn op_excess(&self) -> Option<f64> {
        let v = self.op_f64("excess")?;
        if v < 0.0 {
            None
        } else {
            Some(v)
        }
    }

    /// Called by the mode runner when a new mode task starts.
    pub(crate) fn on_mode_start(&self, name: &str) {
        *self.phase_limits.lock() = PhaseLimits::unknown(self.n_phase());
        let op_snapshot: BTreeMap<String, serde_json::Value> = self.op.read().clone();
        let mut diag = self.diag.lock();
        diag.clear();
        diag.set("mode", json!([name, op_snapshot]));
    }

    pub fn diag_set(&self, key: &str, value: impl serde::Serialize) {
        self.diag.lock().set(key, value);
    }

    /// The structured diagnostic snapshot served by the control surface.
    pub fn state_json(&self) -> serde_json::Value {
        let mut state = self.diag.lock().to_json();
        let pv = self.pv.lock();
        let limits = self.phase_limits.lock();
        state["derived"] = json!({
            "i_batt_avg": *self.i_batt_avg.read(),
            "i_pv_max": pv.i_pv_max,
            "pv_margin": pv.pv_margin,
            "solar_p": self.solar_p(),
            "ps_min": limits.ps_min,
            "ps_max": limits.ps_max,
        });
        state
    }

    // ---- activation ----------------------------------------------------

    async fn prime_system(&self) -> Result<()> {
        let base: Vec<String> = [
            paths::NUM_PHASES,
            paths::BATTERY_VOLTAGE,
            paths::BATTERY_CURRENT,
            paths::BATTERY_SOC,
            paths::PV_CURRENT,
            paths::VEBUS_CURRENT,
            paths::BATTERY_SERVICE,
            paths::VEBUS_SERVICE,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        self.cache.prime(&self.system_service, &base).await;

        let n_phase = self
            .cache
            .get_f64(&self.sys(paths::NUM_PHASES))
            .map_or(0, |v| v as usize);
        let mut per_phase = Vec::new();
        for i in 0..n_phase {
            per_phase.push(paths::ac_in_power(i));
            per_phase.push(paths::grid_power(i));
            per_phase.push(paths::consumption(i));
            per_phase.push(paths::consumption_on_output(i));
        }
        self.cache.prime(&self.system_service, &per_phase).await;
        Ok(())
    }

    async fn discover(&self) -> Result<()> {
        let n_phase = self
            .cache
            .get_f64(&self.sys(paths::NUM_PHASES))
            .map_or(0, |v| v as usize);

        let bms_service = self
            .cache
            .get(&self.sys(paths::BATTERY_SERVICE))
            .and_then(|v| v.as_text().map(str::to_string))
            .context("battery service not announced")?;

        let mut vebus = self
            .cache
            .get(&self.sys(paths::VEBUS_SERVICE))
            .and_then(|v| v.as_text().map(str::to_string));
        if vebus.is_none() {
            warn!("inverter aggregator not announced yet, re-reading");
            vebus = self
                .bus
                .read(&self.system_service, paths::VEBUS_SERVICE)
                .await
                .ok()
                .flatten()
                .and_then(|v| v.as_text().map(str::to_string));
        }
        let Some(vebus_service) = vebus else {
            bail!("inverter aggregator service not known");
        };

        let bms_paths: Vec<String> = [
            paths::BMS_LOW_VOLTAGE,
            paths::BMS_MAX_CHARGE_VOLTAGE,
            paths::BMS_MAX_CHARGE_CURRENT,
            paths::BMS_MAX_DISCHARGE_CURRENT,
            paths::BMS_ALLOW_CHARGE,
            paths::BMS_ALLOW_DISCHARGE,
            paths::BMS_CAPACITY,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        self.cache.prime(&bms_service, &bms_paths).await;

        let mut vebus_paths = vec![paths::ACTIVE_IN_P_TOTAL.to_string()];
        for i in 0..n_phase {
            vebus_paths.push(paths::setpoint(i));
            vebus_paths.push(paths::active_in_p(i));
        }
        self.cache.prime(&vebus_service, &vebus_paths).await;

        let b_cap = self
            .cache
            .get_f64(&SignalId::new(bms_service.clone(), paths::BMS_CAPACITY))
            .context("battery capacity not reported")?;

        *self.topo.write() = Some(Topology {
            n_phase,
            bms_service,
            vebus_service,
            b_cap,
        });
        Ok(())
    }

    async fn batt_avg_task(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(BATT_AVG_PERIOD);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            let sample = self.i_batt().ok();
            let avg = self.batt_window.lock().push(sample);
            *self.i_batt_avg.write() = avg;
        }
    }

    async fn pv_track_task(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(PV_TRACK_PERIOD);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Ok(i_pv) = self.i_pv() {
                self.pv.lock().observe(i_pv);
            }
        }
    }

    /// The scoped active phase: populate the cache, discover the topology,
    /// start the periodic tasks and run the mode loop until cancelled. On the
    /// way out all children are stopped and the bus name is released under a
    /// short deadline.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        self.prime_system().await?;
        self.discover().await?;

        // step from the system's actual operating point
        *self.damper.lock() = Damper::seeded(self.p_inv_observed());
        *self.phase_limits.lock() = PhaseLimits::unknown(self.n_phase());

        let children = cancel.child_token();
        let mut pump = self.cache.spawn_pump(children.clone());

        let tracker = TaskTracker::new();
        tracker.spawn(Arc::clone(&self).batt_avg_task(children.clone()));
        tracker.spawn(Arc::clone(&self).pv_track_task(children.clone()));
        if let Some(store) = self.store.clone() {
            if !self.cfg.op.fake {
                tracker.spawn(crate::solar::solar_log(
                    Arc::clone(&self),
                    store,
                    children.clone(),
                ));
            }
        }
        tracker.close();

        let suffix = if self.cfg.op.fake {
            "fake"
        } else {
            self.cfg.name.as_str()
        };
        let bus_name = format!("com.openinv.controller.{suffix}");
        self.bus
            .register_name(&bus_name)
            .await
            .context("claiming the controller bus name")?;
        info!(name = %bus_name, phases = self.n_phase(), "controller active");

        // the pump only ends early when the transport goes away under us
        let result = tokio::select! {
            result = crate::modes::run_mode_loop(Arc::clone(&self), cancel.clone()) => result,
            _ = &mut pump => Err(anyhow::anyhow!("bus connection lost")),
        };

        children.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), tracker.wait()).await;
        pump.abort();

        match tokio::time::timeout(NAME_RELEASE_DEADLINE, self.bus.release_name(&bus_name)).await {
            Ok(Ok(())) => info!(name = %bus_name, "bus name released"),
            Ok(Err(err)) => warn!(error = %err, "bus name release failed"),
            Err(_) => warn!("bus name release timed out"),
        }

        result
    }
}
