//! Structured diagnostic state exposed through the control surface.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::limits::LimitTrace;

/// Snapshot of the most recent power decision.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionSnapshot {
    /// Audit trail of every constraint rule, in pipeline order
    pub limits: Vec<LimitTrace>,
    /// Requested AC power before any rule ran (W)
    pub init: f64,
    /// Target after the pipeline, before damping (W)
    pub dest: f64,
    /// Scalar setpoint actually emitted (W)
    pub setpoint: f64,
    /// Whether the damper limited this cycle's step
    pub damped: bool,
    /// Per-phase split of the setpoint (W)
    pub inv_phases: Vec<f64>,
    /// The emitted vector after critical-load correction (W)
    pub phases: Vec<f64>,
    pub at: DateTime<Utc>,
}

/// Free-form diagnostic map, one entry per subsystem ("mode", "inverter",
/// "analyze", ...). Cleared whenever a new mode starts.
#[derive(Debug, Clone, Default)]
pub struct DiagState {
    entries: serde_json::Map<String, serde_json::Value>,
}

impl DiagState {
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn set(&mut self, key: &str, value: impl Serialize) {
        match serde_json::to_value(value) {
            Ok(v) => {
                self.entries.insert(key.to_string(), v);
            }
            Err(err) => {
                tracing::warn!(key, error = %err, "diagnostic entry not serializable");
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(self.entries.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diag_state_roundtrips_entries() {
        let mut diag = DiagState::default();
        diag.set("mode", ("off", 1));
        let json = diag.to_json();
        assert_eq!(json["mode"][0], "off");

        diag.clear();
        assert_eq!(diag.to_json(), serde_json::json!({}));
    }
}
