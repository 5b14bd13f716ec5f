// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use bitflags::bitflags;

use crate::power::{SupervisorError, FAULT_THRESHOLD};

pub const HBRIDGE_COUNT: usize = 4;
/// PID and wiper-park updates run at 100 Hz inside a 1 kHz tick source.
pub const PID_PERIOD_TICKS: u64 = 10;

bitflags! {
    #[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
    pub struct HBridgeFaultFlags: u8 {
        const OVERCURRENT_FWD = 0b0000_0001;
        const OVERCURRENT_REV = 0b0000_0010;
        const STALL           = 0b0000_0100;
        const POSITION_LOST   = 0b0000_1000;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HBridgeMode {
    Coast,
    Forward,
    Reverse,
    Brake,
    WiperPark,
    Pid,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HBridgeState {
    Idle,
    Running,
    Parking,
    Parked,
    Fault,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct PidState {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub integral: f64,
    pub prev_error: f64,
    pub output_min: f64,
    pub output_max: f64,
}

impl PidState {
    /// spec §4.3 #5: `err = target - position`, clamp, anti-windup by
    /// undoing the last integral increment on saturation.
    pub fn update(&mut self, target: f64, position: f64, dt_s: f64) -> f64 {
        let err = target - position;
        let increment = err * dt_s;
        self.integral += increment;
        let d = if dt_s > 0.0 { (err - self.prev_error) / dt_s } else { 0.0 };
        self.prev_error = err;

        let raw = self.kp * err + self.ki * self.integral + self.kd * d;
        let clamped = raw.clamp(self.output_min, self.output_max);
        if (clamped - raw).abs() > f64::EPSILON {
            self.integral -= increment;
        }
        clamped
    }
}

#[derive(Copy, Clone, Debug)]
pub struct HBridgeConfig {
    pub current_limit_ma: i32,
    pub stall_threshold_ma: i32,
    pub stall_time_ms: u64,
    pub park_timeout_ms: u64,
    pub tolerance_per_mille: i32,
}

impl Default for HBridgeConfig {
    fn default() -> Self {
        HBridgeConfig {
            current_limit_ma: 20_000,
            stall_threshold_ma: 12_000,
            stall_time_ms: 200,
            park_timeout_ms: 5_000,
            tolerance_per_mille: 10,
        }
    }
}

#[derive(Clone, Debug)]
pub struct HBridge {
    pub mode: HBridgeMode,
    pub state: HBridgeState,
    pub duty: i32,
    pub measured_current_ma: i32,
    pub position: i32,
    pub target_position: i32,
    pub pid_state: PidState,
    pub fault_flags: HBridgeFaultFlags,
    pub fault_count: u32,
    pub run_time_ms: u64,
    pub last_fault_ms: u64,
    pub locked: bool,
    pub config: HBridgeConfig,
}

impl Default for HBridge {
    fn default() -> Self {
        HBridge {
            mode: HBridgeMode::Coast,
            state: HBridgeState::Idle,
            duty: 0,
            measured_current_ma: 0,
            position: 0,
            target_position: 0,
            pid_state: PidState::default(),
            fault_flags: HBridgeFaultFlags::empty(),
            fault_count: 0,
            run_time_ms: 0,
            last_fault_ms: 0,
            locked: false,
            config: HBridgeConfig::default(),
        }
    }
}

impl HBridge {
    fn enter_fault(&mut self, flag: HBridgeFaultFlags, now_ms: u64) {
        self.last_fault_ms = now_ms;
        self.state = HBridgeState::Fault;
        self.mode = HBridgeMode::Coast;
        self.duty = 0;
        self.fault_flags |= flag;
        self.fault_count += 1;
        if self.fault_count >= FAULT_THRESHOLD {
            self.locked = true;
        }
        tracing::warn!(flags = ?self.fault_flags, count = self.fault_count, "h-bridge fault latched");
    }

    fn filter_current(&mut self, sample_ma: i32) {
        self.measured_current_ma += (sample_ma - self.measured_current_ma) / 4;
    }

    pub(crate) fn tick(&mut self, sample_ma: i32, position: i32, now_ms: u64, tick_index: u64) {
        self.filter_current(sample_ma);
        self.position = position;

        if self.state == HBridgeState::Fault {
            return;
        }
        if self.state == HBridgeState::Idle || self.state == HBridgeState::Parked {
            return;
        }

        self.run_time_ms += 1;

        let duty_fraction = (self.duty.unsigned_abs() as f64) / 1000.0;
        if duty_fraction > 0.5 && self.measured_current_ma.abs() > self.config.stall_threshold_ma
            && self.run_time_ms > self.config.stall_time_ms
        {
            self.enter_fault(HBridgeFaultFlags::STALL, now_ms);
            return;
        }
        if self.measured_current_ma > self.config.current_limit_ma {
            self.enter_fault(HBridgeFaultFlags::OVERCURRENT_FWD, now_ms);
            return;
        }
        if self.measured_current_ma < -self.config.current_limit_ma {
            self.enter_fault(HBridgeFaultFlags::OVERCURRENT_REV, now_ms);
            return;
        }

        match self.state {
            HBridgeState::Parking => {
                let error = self.target_position - self.position;
                if error.abs() <= self.config.tolerance_per_mille {
                    self.state = HBridgeState::Parked;
                    self.mode = HBridgeMode::Brake;
                    self.duty = 0;
                } else if self.run_time_ms > self.config.park_timeout_ms {
                    self.enter_fault(HBridgeFaultFlags::POSITION_LOST, now_ms);
                } else {
                    self.duty = if error > 0 { 500 } else { -500 };
                }
            }
            HBridgeState::Running => {
                if self.mode == HBridgeMode::Pid && tick_index % PID_PERIOD_TICKS == 0 {
                    let out = self.pid_state.update(
                        f64::from(self.target_position),
                        f64::from(self.position),
                        PID_PERIOD_TICKS as f64 / 1000.0,
                    );
                    self.duty = out.round().clamp(-1000.0, 1000.0) as i32;
                }
            }
            _ => {}
        }
    }
}

pub struct HBridgeBank {
    bridges: Vec<HBridge>,
}

impl Default for HBridgeBank {
    fn default() -> Self {
        Self::new()
    }
}

impl HBridgeBank {
    pub fn new() -> Self {
        HBridgeBank {
            bridges: (0..HBRIDGE_COUNT).map(|_| HBridge::default()).collect(),
        }
    }

    fn get(&self, index: usize) -> Result<&HBridge, SupervisorError> {
        self.bridges.get(index).ok_or(SupervisorError::InvalidIndex)
    }

    fn get_mut(&mut self, index: usize) -> Result<&mut HBridge, SupervisorError> {
        self.bridges.get_mut(index).ok_or(SupervisorError::InvalidIndex)
    }

    pub fn set_mode(&mut self, index: usize, mode: HBridgeMode, duty: i32) -> Result<(), SupervisorError> {
        let bridge = self.get_mut(index)?;
        if bridge.locked {
            return Err(SupervisorError::Locked);
        }
        if bridge.state == HBridgeState::Fault {
            return Err(SupervisorError::Faulted);
        }
        bridge.mode = mode;
        bridge.duty = duty.clamp(-1000, 1000);
        bridge.run_time_ms = 0;
        bridge.state = match mode {
            HBridgeMode::WiperPark => HBridgeState::Parking,
            HBridgeMode::Forward | HBridgeMode::Reverse | HBridgeMode::Pid => HBridgeState::Running,
            HBridgeMode::Coast | HBridgeMode::Brake => HBridgeState::Idle,
        };
        Ok(())
    }

    pub fn set_position(&mut self, index: usize, target: i32) -> Result<(), SupervisorError> {
        self.get_mut(index)?.target_position = target.clamp(0, 1000);
        Ok(())
    }

    pub fn set_pid(&mut self, index: usize, kp: f64, ki: f64, kd: f64) -> Result<(), SupervisorError> {
        let bridge = self.get_mut(index)?;
        bridge.pid_state.kp = kp;
        bridge.pid_state.ki = ki;
        bridge.pid_state.kd = kd;
        bridge.pid_state.output_min = -1000.0;
        bridge.pid_state.output_max = 1000.0;
        Ok(())
    }

    pub fn clear_faults(&mut self, index: usize) -> Result<(), SupervisorError> {
        let bridge = self.get_mut(index)?;
        bridge.fault_flags = HBridgeFaultFlags::empty();
        if !bridge.locked {
            bridge.state = HBridgeState::Idle;
            bridge.mode = HBridgeMode::Coast;
            bridge.duty = 0;
        }
        Ok(())
    }

    pub fn reset_lockout(&mut self, index: usize) -> Result<(), SupervisorError> {
        let bridge = self.get_mut(index)?;
        bridge.locked = false;
        bridge.fault_count = 0;
        bridge.state = HBridgeState::Idle;
        bridge.mode = HBridgeMode::Coast;
        bridge.duty = 0;
        Ok(())
    }

    pub fn state(&self, index: usize) -> Result<HBridgeState, SupervisorError> {
        Ok(self.get(index)?.state)
    }

    pub fn fault_flags(&self, index: usize) -> Result<HBridgeFaultFlags, SupervisorError> {
        Ok(self.get(index)?.fault_flags)
    }

    pub fn position(&self, index: usize) -> Result<i32, SupervisorError> {
        Ok(self.get(index)?.position)
    }

    pub fn duty(&self, index: usize) -> Result<i32, SupervisorError> {
        Ok(self.get(index)?.duty)
    }

    pub fn set_config(&mut self, index: usize, config: HBridgeConfig) -> Result<(), SupervisorError> {
        self.get_mut(index)?.config = config;
        Ok(())
    }

    pub fn bridges_iter(&self) -> impl Iterator<Item = &HBridge> {
        self.bridges.iter()
    }

    pub fn tick_1khz(&mut self, diagnostics: &mut dyn HBridgeDiagnostics, now_ms: u64, tick_index: u64) {
        for (index, bridge) in self.bridges.iter_mut().enumerate() {
            let current = diagnostics.read_current_ma(index);
            let position = diagnostics.read_position(index);
            bridge.tick(current, position, now_ms, tick_index);
        }
    }
}

pub trait HBridgeDiagnostics {
    fn read_current_ma(&mut self, index: usize) -> i32 {
        let _ = index;
        0
    }
    fn read_position(&mut self, index: usize) -> i32 {
        let _ = index;
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedDiagnostics {
        current_ma: i32,
        position: i32,
    }
    impl HBridgeDiagnostics for FixedDiagnostics {
        fn read_current_ma(&mut self, _index: usize) -> i32 {
            self.current_ma
        }
        fn read_position(&mut self, _index: usize) -> i32 {
            self.position
        }
    }

    #[test]
    fn wiper_park_reaches_parked_within_tolerance() {
        let mut bank = HBridgeBank::new();
        bank.set_position(0, 1000).unwrap();
        bank.set_mode(0, HBridgeMode::WiperPark, 0).unwrap();
        let mut diag = FixedDiagnostics { current_ma: 0, position: 1000 };
        bank.tick_1khz(&mut diag, 0, 0);
        assert_eq!(bank.state(0).unwrap(), HBridgeState::Parked);
    }

    #[test]
    fn park_timeout_without_progress_faults() {
        let mut bank = HBridgeBank::new();
        bank.set_position(0, 1000).unwrap();
        bank.set_mode(0, HBridgeMode::WiperPark, 0).unwrap();
        let mut diag = FixedDiagnostics { current_ma: 0, position: 0 };
        for ms in 0..6000u64 {
            bank.tick_1khz(&mut diag, ms, ms);
        }
        assert_eq!(bank.state(0).unwrap(), HBridgeState::Fault);
        assert!(bank.fault_flags(0).unwrap().contains(HBridgeFaultFlags::POSITION_LOST));
    }

    #[test]
    fn pid_drives_duty_toward_target() {
        let mut bank = HBridgeBank::new();
        bank.set_pid(0, 2.0, 0.0, 0.0).unwrap();
        bank.set_position(0, 800).unwrap();
        bank.set_mode(0, HBridgeMode::Pid, 0).unwrap();
        let mut diag = FixedDiagnostics { current_ma: 0, position: 200 };
        bank.tick_1khz(&mut diag, 0, 0);
        assert!(bank.duty(0).unwrap() > 0);
    }

    #[test]
    fn overcurrent_forces_coast() {
        let mut bank = HBridgeBank::new();
        bank.set_mode(0, HBridgeMode::Forward, 800).unwrap();
        let mut diag = FixedDiagnostics { current_ma: 25_000, position: 0 };
        for ms in 0..60u64 {
            bank.tick_1khz(&mut diag, ms, ms);
        }
        assert_eq!(bank.state(0).unwrap(), HBridgeState::Fault);
        assert_eq!(bank.mode_is_coast(0), true);
    }

    impl HBridgeBank {
        fn mode_is_coast(&self, index: usize) -> bool {
            self.bridges[index].mode == HBridgeMode::Coast
        }
    }
}
