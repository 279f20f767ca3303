use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use tracing::error;
use validator::Validate;

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AppConfig {
    /// Suffix used when registering the bus name
    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default)]
    #[validate(nested)]
    pub server: ServerConfig,

    #[serde(default)]
    #[validate(nested)]
    pub system: SystemConfig,

    #[serde(default)]
    pub modes: ModesConfig,

    #[serde(default)]
    pub op: OpConfig,

    #[serde(default)]
    pub distkv: Option<DistKvConfig>,
}

/// HTTP control-surface configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    #[validate(length(min = 1))]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .context("Failed to parse socket address")
    }
}

/// Tuning parameters for the control engine.
///
/// All power values are watts on the AC side (positive = feed to AC), all
/// currents are amps at the battery bus bar (positive = from battery to bus).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SystemConfig {
    /// Damper fractional step towards a new target
    #[serde(default = "default_f_step")]
    #[validate(range(min = 0.01, max = 1.0))]
    pub f_step: f64,

    /// Damper minimum step (W); also the "stable" change threshold
    #[serde(default = "default_p_step")]
    #[validate(range(min = 1.0))]
    pub p_step: f64,

    /// SoC margin away from 0/1 inside which damping applies
    #[serde(default = "default_f_delta")]
    #[validate(range(min = 0.0, max = 0.5))]
    pub f_delta: f64,

    /// Allow charging up to the BMS's absolute voltage ceiling
    #[serde(default)]
    pub top_off: bool,

    /// Headroom below the max charge voltage when not topping off (V)
    #[serde(default = "default_u_diff")]
    #[validate(range(min = 0.0))]
    pub umax_diff: f64,

    /// Headroom above the min voltage for discharge tapering (V)
    #[serde(default = "default_u_diff")]
    #[validate(range(min = 0.0))]
    pub umin_diff: f64,

    /// Grid power limits (W); pg_min negative = export allowed
    #[serde(default = "default_pg_min")]
    pub pg_min: f64,

    #[serde(default = "default_pg_max")]
    pub pg_max: f64,

    /// Inverter nominal efficiency
    #[serde(default = "default_inv_eff")]
    #[validate(range(min = 0.05, max = 1.0))]
    pub inv_eff: f64,

    /// Per-phase inverter maximum (W)
    #[serde(default = "default_p_per_phase")]
    #[validate(range(min = 1.0))]
    pub p_per_phase: f64,

    /// Initial PV drop factor: PV is assumed not to fall below max*pv_margin
    #[serde(default = "default_pv_margin")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub pv_margin: f64,

    /// PV headroom (A) kept free so rising solar output can be observed
    #[serde(default = "default_pv_delta")]
    #[validate(range(min = 0.0))]
    pub pv_delta: f64,

    /// Stored PV maximum (A) above which the margin self-tightens
    #[serde(default = "default_pv_shrink_min")]
    #[validate(range(min = 0.0))]
    pub pv_shrink_min: f64,

    /// Battery capacity taper factor for voltage-based current limits
    #[serde(default = "default_cap_scale")]
    #[validate(range(min = 0.1))]
    pub cap_scale: f64,

    /// Approximate internal resistance of the battery pack (Ω)
    #[serde(default = "default_r_int")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub r_int: f64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            f_step: default_f_step(),
            p_step: default_p_step(),
            f_delta: default_f_delta(),
            top_off: false,
            umax_diff: default_u_diff(),
            umin_diff: default_u_diff(),
            pg_min: default_pg_min(),
            pg_max: default_pg_max(),
            inv_eff: default_inv_eff(),
            p_per_phase: default_p_per_phase(),
            pv_margin: default_pv_margin(),
            pv_delta: default_pv_delta(),
            pv_shrink_min: default_pv_shrink_min(),
            cap_scale: default_cap_scale(),
            r_int: default_r_int(),
        }
    }
}

impl SystemConfig {
    /// Recognised `[system]` keys; anything else is skipped with an error log.
    pub const KNOWN: &'static [&'static str] = &[
        "f_step",
        "p_step",
        "f_delta",
        "top_off",
        "umax_diff",
        "umin_diff",
        "pg_min",
        "pg_max",
        "inv_eff",
        "p_per_phase",
        "pv_margin",
        "pv_delta",
        "pv_shrink_min",
        "cap_scale",
        "r_int",
    ];
}

/// Mode selection and per-mode parameter defaults
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModesConfig {
    /// Mode selected at startup
    #[serde(default = "default_mode")]
    pub default: String,

    /// Default operator-parameter overrides, keyed by mode name
    #[serde(flatten)]
    pub defaults: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
}

impl Default for ModesConfig {
    fn default() -> Self {
        Self {
            default: default_mode(),
            defaults: BTreeMap::new(),
        }
    }
}

/// Operator flags
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OpConfig {
    /// Log-only mode; never writes to the inverter
    #[serde(default)]
    pub fake: bool,
}

/// Optional external key-value store connection
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DistKvConfig {
    /// Key prefix under which solar/remote values live
    #[serde(default = "default_distkv_root")]
    pub root: String,
}

// Default value functions
fn default_name() -> String { "main".to_string() }
fn default_host() -> String { "127.0.0.1".to_string() }
fn default_port() -> u16 { 8088 }
fn default_f_step() -> f64 { 0.35 }
fn default_p_step() -> f64 { 100.0 }
fn default_f_delta() -> f64 { 0.2 }
fn default_u_diff() -> f64 { 0.5 }
fn default_pg_min() -> f64 { -12000.0 }
fn default_pg_max() -> f64 { 12000.0 }
fn default_inv_eff() -> f64 { 0.9 }
fn default_p_per_phase() -> f64 { 4500.0 }
fn default_pv_margin() -> f64 { 0.4 }
fn default_pv_delta() -> f64 { 30.0 }
fn default_pv_shrink_min() -> f64 { 1000.0 }
fn default_cap_scale() -> f64 { 4.0 }
fn default_r_int() -> f64 { 0.01 }
fn default_mode() -> String { "off".to_string() }
fn default_distkv_root() -> String { "solar".to_string() }

impl AppConfig {
    /// Load configuration from TOML files and environment variables
    ///
    /// Later sources override earlier ones:
    /// 1. config/default.toml
    /// 2. config/local.toml (if present)
    /// 3. Environment variables with OIC__ prefix (OIC__SYSTEM__P_STEP -> system.p_step)
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Toml::file("config/default.toml"))
            .merge(Toml::file("config/local.toml"))
            .merge(Env::prefixed("OIC__").split("__"));
        Self::from_figment(figment)
    }

    /// Extract and validate a configuration from an assembled figment.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        for key in unknown_system_keys(&figment) {
            error!(key = %key, "unknown system option, skipping");
        }

        let config: AppConfig = figment
            .extract()
            .context("Failed to parse configuration")?;

        config
            .validate()
            .context("Configuration validation failed")?;

        Ok(config)
    }

    /// Per-mode parameter defaults from `[modes.<name>]`.
    pub fn mode_defaults(&self, mode: &str) -> BTreeMap<String, serde_json::Value> {
        self.modes.defaults.get(mode).cloned().unwrap_or_default()
    }
}

/// Keys under `[system]` that the engine does not recognise.
pub fn unknown_system_keys(figment: &Figment) -> Vec<String> {
    let Ok(value) = figment.extract::<figment::value::Value>() else {
        return Vec::new();
    };
    let Some(system) = value
        .as_dict()
        .and_then(|dict| dict.get("system"))
        .and_then(|v| v.as_dict())
    else {
        return Vec::new();
    };
    system
        .keys()
        .filter(|k| !SystemConfig::KNOWN.contains(&k.as_str()))
        .map(|k| k.to_string())
        .collect()
}
