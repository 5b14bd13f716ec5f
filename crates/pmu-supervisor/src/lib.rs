// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! C3: the output supervisor (spec §4.3). Owns PROFET power-output and
//! H-bridge state, runs their protection algorithms on the 1 kHz tick,
//! and exposes a protection snapshot for telemetry.

pub mod hbridge;
pub mod power;

pub use hbridge::{
    HBridge, HBridgeBank, HBridgeConfig, HBridgeDiagnostics, HBridgeFaultFlags, HBridgeMode,
    HBridgeState, PidState, HBRIDGE_COUNT,
};
pub use power::{
    PowerBank, PowerDiagnostics, PowerFaultFlags, PowerOutput, PowerOutputConfig, PowerOutputState,
    SupervisorError, POWER_OUTPUT_COUNT,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProtectionStatus {
    Ok,
    Warning,
    Fault,
    Critical,
}

/// spec §3 "Protection Snapshot": refreshed at the protection task rate.
#[derive(Copy, Clone, Debug)]
pub struct ProtectionSnapshot {
    pub battery_mv: i32,
    pub total_current_ma: i32,
    pub mcu_temp_c: i32,
    pub board_temp_l_c: i32,
    pub board_temp_r_c: i32,
    pub status: ProtectionStatus,
    pub user_error_flags: u16,
    pub is_turning_off: bool,
}

impl Default for ProtectionSnapshot {
    fn default() -> Self {
        ProtectionSnapshot {
            battery_mv: 12_000,
            total_current_ma: 0,
            mcu_temp_c: 25,
            board_temp_l_c: 25,
            board_temp_r_c: 25,
            status: ProtectionStatus::Ok,
            user_error_flags: 0,
            is_turning_off: false,
        }
    }
}

/// Raw readings fed into the protection snapshot each refresh (spec
/// §4.4 "Protection" task). A thin trait so `pmu-core` can source these
/// from the simulation backend or real drivers interchangeably.
pub trait ProtectionDiagnostics {
    fn battery_mv(&mut self) -> i32 {
        12_000
    }
    fn mcu_temp_c(&mut self) -> i32 {
        25
    }
    fn board_temp_l_c(&mut self) -> i32 {
        25
    }
    fn board_temp_r_c(&mut self) -> i32 {
        25
    }
}

pub struct Supervisor {
    pub power: PowerBank,
    pub hbridges: HBridgeBank,
    pub protection: ProtectionSnapshot,
    tick_index: u64,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Supervisor {
            power: PowerBank::new(),
            hbridges: HBridgeBank::new(),
            protection: ProtectionSnapshot::default(),
            tick_index: 0,
        }
    }

    pub fn set_state(&mut self, output: usize, on: bool) -> Result<(), SupervisorError> {
        self.power.set_state(output, on)
    }

    pub fn set_pwm(&mut self, output: usize, duty_0_1000: u16) -> Result<(), SupervisorError> {
        self.power.set_pwm(output, duty_0_1000)
    }

    pub fn get_current(&self, output: usize) -> Result<i32, SupervisorError> {
        self.power.get_current(output)
    }

    pub fn get_temperature(&self, output: usize) -> Result<i32, SupervisorError> {
        self.power.get_temperature(output)
    }

    pub fn hbridge_set_mode(&mut self, bridge: usize, mode: HBridgeMode, duty: i32) -> Result<(), SupervisorError> {
        self.hbridges.set_mode(bridge, mode, duty)
    }

    pub fn hbridge_set_position(&mut self, bridge: usize, target: i32) -> Result<(), SupervisorError> {
        self.hbridges.set_position(bridge, target)
    }

    pub fn hbridge_set_pid(&mut self, bridge: usize, kp: f64, ki: f64, kd: f64) -> Result<(), SupervisorError> {
        self.hbridges.set_pid(bridge, kp, ki, kd)
    }

    pub fn hbridge_clear_faults(&mut self, bridge: usize) -> Result<(), SupervisorError> {
        self.hbridges.clear_faults(bridge)
    }

    pub fn clear_faults(&mut self, output: usize) -> Result<(), SupervisorError> {
        self.power.clear_faults(output)
    }

    /// Runs both banks' protection algorithms for one 1 kHz tick (spec
    /// §4.3, §4.4 "Control" task step `supervisor.tick_1khz()`).
    pub fn tick_1khz(&mut self, power_diag: &mut dyn PowerDiagnostics, hbridge_diag: &mut dyn HBridgeDiagnostics, now_ms: u64) {
        self.power.tick_1khz(power_diag, now_ms);
        self.hbridges.tick_1khz(hbridge_diag, now_ms, self.tick_index);
        self.tick_index += 1;
    }

    /// Refreshes the protection snapshot (spec §4.4 "Protection" task).
    pub fn refresh_protection(&mut self, diagnostics: &mut dyn ProtectionDiagnostics) {
        self.protection.battery_mv = diagnostics.battery_mv();
        self.protection.mcu_temp_c = diagnostics.mcu_temp_c();
        self.protection.board_temp_l_c = diagnostics.board_temp_l_c();
        self.protection.board_temp_r_c = diagnostics.board_temp_r_c();
        self.protection.total_current_ma = self.power.outputs_iter().map(|o| o.measured_current_ma.max(0)).sum();

        let any_critical = self.power.outputs_iter().any(|o| o.state == PowerOutputState::Fault && o.locked)
            || self.hbridges.bridges_iter().any(|b| b.state == HBridgeState::Fault && b.locked);
        let any_fault = self.power.outputs_iter().any(|o| o.state == PowerOutputState::Fault)
            || self.hbridges.bridges_iter().any(|b| b.state == HBridgeState::Fault);

        self.protection.status = if any_critical {
            ProtectionStatus::Critical
        } else if any_fault {
            ProtectionStatus::Fault
        } else {
            ProtectionStatus::Ok
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullDiagnostics;
    impl PowerDiagnostics for NullDiagnostics {}
    impl HBridgeDiagnostics for NullDiagnostics {}
    impl ProtectionDiagnostics for NullDiagnostics {}

    #[test]
    fn protection_snapshot_reflects_latched_fault() {
        let mut sup = Supervisor::new();
        sup.set_state(0, true).unwrap();
        struct Hot;
        impl PowerDiagnostics for Hot {
            fn read_temp_c(&mut self, _index: usize) -> i32 {
                200
            }
        }
        impl HBridgeDiagnostics for Hot {}
        sup.tick_1khz(&mut Hot, &mut Hot, 0);
        sup.refresh_protection(&mut NullDiagnostics);
        assert_eq!(sup.protection.status, ProtectionStatus::Fault);
    }

    #[test]
    fn idle_supervisor_reports_ok() {
        let mut sup = Supervisor::new();
        sup.tick_1khz(&mut NullDiagnostics, &mut NullDiagnostics, 0);
        sup.refresh_protection(&mut NullDiagnostics);
        assert_eq!(sup.protection.status, ProtectionStatus::Ok);
    }
}
