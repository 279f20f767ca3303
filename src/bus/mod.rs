//! Object-bus transport boundary.
//!
//! The control engine only ever talks to remote services through [`SignalBus`]:
//! one bulk tree fetch per service at startup, change notifications afterwards,
//! and setpoint writes. The real transport lives outside this crate; the `sim`
//! feature provides an in-memory implementation for tests and dry runs.

#[cfg(feature = "sim")]
pub mod sim;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;

/// A scalar (or service-name) value carried by a bus path.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Float(f64),
    Int(i64),
    Bool(bool),
    Text(String),
}

impl Value {
    /// Numeric view; integers and booleans coerce the way the wire format does.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            Value::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Value::Text(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::Int(v) => Some(*v != 0),
            Value::Float(v) => Some(*v != 0.0),
            Value::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

/// Result code of a setpoint write, as reported by the remote publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WriteAck {
    Ok = 0,
    ReadOnly = 1,
    Rejected = 2,
}

/// One change notification: `value == None` means the publisher vanished and
/// the path must be treated as absent downstream.
#[derive(Debug, Clone)]
pub struct SignalUpdate {
    pub service: String,
    pub path: String,
    pub value: Option<Value>,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("service not present on the bus: {0}")]
    NoService(String),

    #[error("path not exported by {service}: {path}")]
    NoPath { service: String, path: String },

    #[error("bus connection lost: {0}")]
    Transport(String),
}

/// Transport used by the signal cache and the controller.
///
/// Implementations must be cheap to clone behind an `Arc` and deliver updates
/// in arrival order.
#[async_trait]
pub trait SignalBus: Send + Sync {
    /// Fetch every exported path of a service in one call.
    async fn fetch_tree(&self, service: &str) -> Result<HashMap<String, Value>, BusError>;

    /// Read a single path; `Ok(None)` means the path exists but carries no value.
    async fn read(&self, service: &str, path: &str) -> Result<Option<Value>, BusError>;

    /// Forward a write to the remote publisher.
    async fn write(&self, service: &str, path: &str, value: Value) -> Result<WriteAck, BusError>;

    /// Services whose name starts with the given prefix (e.g. solar chargers).
    async fn services_with_prefix(&self, prefix: &str) -> Vec<String>;

    /// Subscribe to the bus-wide update stream.
    fn updates(&self) -> broadcast::Receiver<SignalUpdate>;

    /// Claim a well-known bus name for the lifetime of the active phase.
    async fn register_name(&self, name: &str) -> Result<(), BusError>;

    /// Release a previously claimed name. Idempotent.
    async fn release_name(&self, name: &str) -> Result<(), BusError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_coercions() {
        assert_eq!(Value::Float(1.5).as_f64(), Some(1.5));
        assert_eq!(Value::Int(3).as_f64(), Some(3.0));
        assert_eq!(Value::Bool(true).as_f64(), Some(1.0));
        assert_eq!(Value::Text("x".into()).as_f64(), None);
        assert_eq!(Value::Int(0).as_bool(), Some(false));
        assert_eq!(Value::Text("com.x.bms".into()).as_text(), Some("com.x.bms"));
    }
}
