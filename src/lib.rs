//! Closed-loop setpoint controller for hybrid PV/battery/inverter
//! installations.
//!
//! The engine sits between a BMS, the solar-charge ecosystem and one or more
//! grid-tied inverter/charger units, and continuously decides how much real
//! power each inverter phase should move to or from the AC grid. See the
//! `controller` module for the decision path and `modes` for the operating
//! policies.

pub mod api;
pub mod bms;
pub mod bus;
pub mod config;
pub mod controller;
pub mod distkv;
pub mod modes;
pub mod platform;
pub mod signals;
pub mod solar;
pub mod telemetry;
