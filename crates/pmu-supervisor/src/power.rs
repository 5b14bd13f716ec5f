// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use bitflags::bitflags;

pub const POWER_OUTPUT_COUNT: usize = 30;
pub const FAULT_THRESHOLD: u32 = 3;

bitflags! {
    #[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
    pub struct PowerFaultFlags: u8 {
        const OVERCURRENT    = 0b0000_0001;
        const SHORT_TO_GROUND = 0b0000_0010;
        const THERMAL        = 0b0000_0100;
        const OPEN_LOAD      = 0b0000_1000;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PowerOutputState {
    Off,
    On,
    Pwm,
    Fault,
}

#[derive(Copy, Clone, Debug)]
pub struct PowerOutputConfig {
    pub current_limit_ma: i32,
    pub thermal_shutdown_c: i32,
    pub debounce_ms: u64,
}

impl Default for PowerOutputConfig {
    fn default() -> Self {
        PowerOutputConfig {
            current_limit_ma: 15_000,
            thermal_shutdown_c: 125,
            debounce_ms: 10,
        }
    }
}

/// One PROFET high-side channel (spec §4.3, §3 "Power output").
#[derive(Clone, Debug)]
pub struct PowerOutput {
    pub state: PowerOutputState,
    pub commanded_duty: u16,
    pub measured_current_ma: i32,
    pub measured_temp_c: i32,
    pub fault_flags: PowerFaultFlags,
    pub retry_count: u32,
    pub fault_count: u32,
    pub last_fault_ms: u64,
    pub locked: bool,
    pub config: PowerOutputConfig,
    over_current_since_ms: Option<u64>,
}

impl Default for PowerOutput {
    fn default() -> Self {
        PowerOutput {
            state: PowerOutputState::Off,
            commanded_duty: 0,
            measured_current_ma: 0,
            measured_temp_c: 25,
            fault_flags: PowerFaultFlags::empty(),
            retry_count: 0,
            fault_count: 0,
            last_fault_ms: 0,
            locked: false,
            config: PowerOutputConfig::default(),
            over_current_since_ms: None,
        }
    }
}

impl PowerOutput {
    /// EMA filter of measured current: weight ~1/4 new (spec §4.3 #1).
    pub(crate) fn filter_current(&mut self, sample_ma: i32) {
        self.measured_current_ma += (sample_ma - self.measured_current_ma) / 4;
    }

    fn enter_fault(&mut self, flag: PowerFaultFlags, now_ms: u64) {
        self.state = PowerOutputState::Fault;
        self.commanded_duty = 0;
        self.fault_flags |= flag;
        self.fault_count += 1;
        self.last_fault_ms = now_ms;
        if self.fault_count >= FAULT_THRESHOLD {
            self.locked = true;
        }
        tracing::warn!(flags = ?self.fault_flags, count = self.fault_count, "power output fault latched");
    }

    /// One 1 kHz tick's worth of diagnostics for this output (spec §4.3
    /// supervisory algorithms 1/3/4).
    pub(crate) fn tick(&mut self, sample_ma: i32, temp_c: i32, short: bool, open_load: bool, now_ms: u64) {
        self.filter_current(sample_ma);
        self.measured_temp_c = temp_c;

        if self.state == PowerOutputState::Fault {
            return;
        }

        if short {
            self.enter_fault(PowerFaultFlags::SHORT_TO_GROUND, now_ms);
            return;
        }
        if self.measured_temp_c >= self.config.thermal_shutdown_c {
            self.enter_fault(PowerFaultFlags::THERMAL, now_ms);
            return;
        }
        let commanded_on = matches!(self.state, PowerOutputState::On | PowerOutputState::Pwm);
        if commanded_on && open_load {
            self.enter_fault(PowerFaultFlags::OPEN_LOAD, now_ms);
            return;
        }

        if self.measured_current_ma > self.config.current_limit_ma {
            let since = *self.over_current_since_ms.get_or_insert(now_ms);
            if now_ms.saturating_sub(since) >= self.config.debounce_ms {
                self.enter_fault(PowerFaultFlags::OVERCURRENT, now_ms);
            }
        } else {
            self.over_current_since_ms = None;
        }
    }
}

#[derive(Debug, thiserror::Error, Copy, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("output index out of range")]
    InvalidIndex,
    #[error("output is latched in a fault state")]
    Faulted,
    #[error("output is locked out pending explicit clear")]
    Locked,
}

pub struct PowerBank {
    outputs: Vec<PowerOutput>,
}

impl Default for PowerBank {
    fn default() -> Self {
        Self::new()
    }
}

impl PowerBank {
    pub fn new() -> Self {
        PowerBank {
            outputs: (0..POWER_OUTPUT_COUNT).map(|_| PowerOutput::default()).collect(),
        }
    }

    fn get(&self, index: usize) -> Result<&PowerOutput, SupervisorError> {
        self.outputs.get(index).ok_or(SupervisorError::InvalidIndex)
    }

    fn get_mut(&mut self, index: usize) -> Result<&mut PowerOutput, SupervisorError> {
        self.outputs.get_mut(index).ok_or(SupervisorError::InvalidIndex)
    }

    pub fn set_state(&mut self, index: usize, on: bool) -> Result<(), SupervisorError> {
        let output = self.get_mut(index)?;
        if output.locked {
            return Err(SupervisorError::Locked);
        }
        if output.state == PowerOutputState::Fault {
            return Err(SupervisorError::Faulted);
        }
        output.state = if on { PowerOutputState::On } else { PowerOutputState::Off };
        output.commanded_duty = if on { 1000 } else { 0 };
        Ok(())
    }

    pub fn set_pwm(&mut self, index: usize, duty_0_1000: u16) -> Result<(), SupervisorError> {
        let output = self.get_mut(index)?;
        if output.locked {
            return Err(SupervisorError::Locked);
        }
        if output.state == PowerOutputState::Fault {
            return Err(SupervisorError::Faulted);
        }
        let duty = duty_0_1000.min(1000);
        output.commanded_duty = duty;
        output.state = if duty == 0 { PowerOutputState::Off } else { PowerOutputState::Pwm };
        Ok(())
    }

    pub fn get_current(&self, index: usize) -> Result<i32, SupervisorError> {
        Ok(self.get(index)?.measured_current_ma)
    }

    pub fn get_temperature(&self, index: usize) -> Result<i32, SupervisorError> {
        Ok(self.get(index)?.measured_temp_c)
    }

    pub fn state(&self, index: usize) -> Result<PowerOutputState, SupervisorError> {
        Ok(self.get(index)?.state)
    }

    pub fn fault_flags(&self, index: usize) -> Result<PowerFaultFlags, SupervisorError> {
        Ok(self.get(index)?.fault_flags)
    }

    /// Explicit manual clear (spec §4.3 "Clearing is manual per output").
    /// Does not unlatch lockout once `fault_count` has reached the
    /// threshold; that requires [`PowerBank::reset_lockout`].
    pub fn clear_faults(&mut self, index: usize) -> Result<(), SupervisorError> {
        let output = self.get_mut(index)?;
        output.fault_flags = PowerFaultFlags::empty();
        if !output.locked {
            output.state = PowerOutputState::Off;
            output.commanded_duty = 0;
        }
        Ok(())
    }

    pub fn reset_lockout(&mut self, index: usize) -> Result<(), SupervisorError> {
        let output = self.get_mut(index)?;
        output.locked = false;
        output.fault_count = 0;
        output.state = PowerOutputState::Off;
        output.commanded_duty = 0;
        Ok(())
    }

    pub fn set_config(&mut self, index: usize, config: PowerOutputConfig) -> Result<(), SupervisorError> {
        self.get_mut(index)?.config = config;
        Ok(())
    }

    pub fn outputs_iter(&self) -> impl Iterator<Item = &PowerOutput> {
        self.outputs.iter()
    }

    /// Runs the per-output protection checks for one 1 kHz tick (spec
    /// §4.3). `diagnostics` supplies this tick's raw samples.
    pub fn tick_1khz(&mut self, diagnostics: &mut dyn PowerDiagnostics, now_ms: u64) {
        for (index, output) in self.outputs.iter_mut().enumerate() {
            let sample_ma = diagnostics.read_current_ma(index);
            let temp_c = diagnostics.read_temp_c(index);
            let short = diagnostics.read_short(index);
            let open_load = diagnostics.read_open_load(index);
            output.tick(sample_ma, temp_c, short, open_load, now_ms);
        }
    }
}

/// Diagnostic sample source for one control tick, supplied by whatever
/// owns the PROFET ADC channels (spec §4.3). Methods default to benign
/// readings so a test only needs to override what it exercises.
pub trait PowerDiagnostics {
    fn read_current_ma(&mut self, index: usize) -> i32 {
        let _ = index;
        0
    }
    fn read_temp_c(&mut self, index: usize) -> i32 {
        let _ = index;
        25
    }
    fn read_short(&mut self, index: usize) -> bool {
        let _ = index;
        false
    }
    fn read_open_load(&mut self, index: usize) -> bool {
        let _ = index;
        false
    }
}
