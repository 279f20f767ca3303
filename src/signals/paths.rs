//! Hierarchical telemetry paths exposed by the surrounding ecosystem.
//!
//! Phase-indexed paths are 1-based on the wire (`/Ac/Grid/L1/Power` is the
//! first phase).

// System service
pub const NUM_PHASES: &str = "/Ac/ActiveIn/NumberOfPhases";
pub const BATTERY_VOLTAGE: &str = "/Dc/Battery/Voltage";
pub const BATTERY_CURRENT: &str = "/Dc/Battery/Current";
pub const BATTERY_SOC: &str = "/Dc/Battery/Soc";
pub const PV_CURRENT: &str = "/Dc/Pv/Current";
pub const VEBUS_CURRENT: &str = "/Dc/Vebus/Current";
pub const BATTERY_SERVICE: &str = "/Dc/Battery/BatteryService";
pub const VEBUS_SERVICE: &str = "/VebusService";

pub fn ac_in_power(phase: usize) -> String {
    format!("/Ac/ActiveIn/L{}/Power", phase + 1)
}

pub fn grid_power(phase: usize) -> String {
    format!("/Ac/Grid/L{}/Power", phase + 1)
}

pub fn consumption(phase: usize) -> String {
    format!("/Ac/Consumption/L{}/Power", phase + 1)
}

pub fn consumption_on_output(phase: usize) -> String {
    format!("/Ac/ConsumptionOnOutput/L{}/Power", phase + 1)
}

// BMS service (discovered at runtime from BATTERY_SERVICE)
pub const BMS_LOW_VOLTAGE: &str = "/Info/BatteryLowVoltage";
pub const BMS_MAX_CHARGE_VOLTAGE: &str = "/Info/MaxChargeVoltage";
pub const BMS_MAX_CHARGE_CURRENT: &str = "/Info/MaxChargeCurrent";
pub const BMS_MAX_DISCHARGE_CURRENT: &str = "/Info/MaxDischargeCurrent";
pub const BMS_ALLOW_CHARGE: &str = "/Io/AllowToCharge";
pub const BMS_ALLOW_DISCHARGE: &str = "/Io/AllowToDischarge";
pub const BMS_CAPACITY: &str = "/Capacity";

// Inverter aggregator service
pub const ACTIVE_IN_P_TOTAL: &str = "/Ac/ActiveIn/P";

pub fn setpoint(phase: usize) -> String {
    format!("/Hub4/L{}/AcPowerSetpoint", phase + 1)
}

pub fn active_in_p(phase: usize) -> String {
    format!("/Ac/ActiveIn/L{}/P", phase + 1)
}

// Solar charger services (logging only)
pub const YIELD_POWER: &str = "/Yield/Power";
pub const CUSTOM_NAME: &str = "/CustomName";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_paths_are_one_based() {
        assert_eq!(grid_power(0), "/Ac/Grid/L1/Power");
        assert_eq!(setpoint(2), "/Hub4/L3/AcPowerSetpoint");
        assert_eq!(active_in_p(1), "/Ac/ActiveIn/L2/P");
    }
}
