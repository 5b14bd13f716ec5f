// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Short-lived adapters between `Core`'s disjoint fields and the
//! `InputSource`/`OutputSink`/`ProtectionDiagnostics`/`CanTelemetrySource`
//! traits the component crates expect. `Core` itself never implements
//! any of these: a single struct can't be two independently-live `&mut
//! dyn Trait` arguments at once (see `LogicEngine::execute`'s `input`
//! and `output` params, which must name disjoint data), so each call
//! site builds one of these from whichever fields it actually needs.

use pmu_channels::{ChannelError, ChannelRegistry, InputSource, OutputSink};
use pmu_logic::LogicEngine;
use pmu_protocol::CanTelemetrySource;
use pmu_supervisor::{
    HBridgeMode, PowerOutputState, ProtectionDiagnostics, Supervisor, HBRIDGE_COUNT,
    POWER_OUTPUT_COUNT,
};
use pmu_types::ChannelId;

use crate::drivers::{AnalogInputs, DigitalInputs};

/// Reserved analog-channel indices for board-level system sensors that
/// feed the protection snapshot. These live outside the range a board
/// wires to registered [`pmu_types::ChannelClass::AnalogInput`]
/// channels (DESIGN.md: a dedicated system-sensor driver trait wasn't
/// worth adding on top of the five already named by the workspace
/// shape, so the reading is folded into `AnalogInputs` at fixed
/// indices instead).
pub const BATTERY_SENSE_INDEX: u16 = 0xFF00;
pub const MCU_TEMP_SENSE_INDEX: u16 = 0xFF01;
pub const BOARD_TEMP_L_SENSE_INDEX: u16 = 0xFF02;
pub const BOARD_TEMP_R_SENSE_INDEX: u16 = 0xFF03;

/// Field selector for an output's mirror sub-channel (spec §4.1
/// `tick()`: "recomputes all output sub-channels (status code, current,
/// voltage estimate, active flag, duty) that mirror supervisor state").
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MirrorField {
    StatusCode,
    CurrentMa,
    VoltageEstimateMv,
    ActiveFlag,
    Duty,
}

const MIRROR_FIELD_COUNT: u16 = 5;

/// `physical_index` base for power-output mirror sub-channels: one
/// contiguous block of [`MIRROR_FIELD_COUNT`] per output, indexed by
/// [`power_mirror_index`].
pub const POWER_MIRROR_BASE: u16 = 0xF000;
/// `physical_index` base for H-bridge mirror sub-channels, immediately
/// following the power-output mirror range.
pub const HBRIDGE_MIRROR_BASE: u16 = POWER_MIRROR_BASE + POWER_OUTPUT_COUNT as u16 * MIRROR_FIELD_COUNT;

pub fn power_mirror_index(output: u16, field: MirrorField) -> u16 {
    POWER_MIRROR_BASE + output * MIRROR_FIELD_COUNT + field as u16
}

pub fn hbridge_mirror_index(bridge: u16, field: MirrorField) -> u16 {
    HBRIDGE_MIRROR_BASE + bridge * MIRROR_FIELD_COUNT + field as u16
}

fn power_status_code(state: PowerOutputState) -> i32 {
    match state {
        PowerOutputState::Off => 0,
        PowerOutputState::On => 1,
        PowerOutputState::Pwm => 2,
        PowerOutputState::Fault => 3,
    }
}

/// Input source for the registry's own per-tick refresh
/// ([`pmu_channels::ChannelRegistry::tick`]) and for command-dispatch
/// reads: board drivers plus a read-only view of the supervisor for
/// `SystemInput` channels.
pub struct ChannelInput<'a, A, D> {
    pub analog: &'a mut A,
    pub digital: &'a mut D,
    pub supervisor: &'a Supervisor,
}

impl<'a, A: AnalogInputs, D: DigitalInputs> InputSource for ChannelInput<'a, A, D> {
    fn read_analog(&mut self, physical_index: u16) -> i32 {
        self.analog.read_analog(physical_index)
    }
    fn read_digital(&mut self, physical_index: u16) -> i32 {
        self.digital.read_digital(physical_index)
    }
    fn read_frequency(&mut self, physical_index: u16) -> i32 {
        self.digital.read_frequency(physical_index)
    }
    fn read_switch(&mut self, physical_index: u16) -> i32 {
        self.digital.read_switch(physical_index)
    }
    fn read_system(&mut self, physical_index: u16) -> i32 {
        match physical_index {
            0 => self.supervisor.protection.battery_mv,
            1 => self.supervisor.protection.mcu_temp_c,
            2 => self.supervisor.protection.board_temp_l_c,
            3 => self.supervisor.protection.board_temp_r_c,
            _ => 0,
        }
    }

    /// Output mirror sub-channels (spec §4.1 `tick()`). Battery voltage
    /// scaled by commanded duty stands in for a real output-voltage
    /// sense line, which is out of scope (spec §1).
    fn read_computed(&mut self, physical_index: u16) -> i32 {
        let battery_mv = self.supervisor.protection.battery_mv;
        if (POWER_MIRROR_BASE..HBRIDGE_MIRROR_BASE).contains(&physical_index) {
            let offset = physical_index - POWER_MIRROR_BASE;
            let output = (offset / MIRROR_FIELD_COUNT) as usize;
            let field = offset % MIRROR_FIELD_COUNT;
            let Some(o) = self.supervisor.power.outputs_iter().nth(output) else {
                return 0;
            };
            return match field {
                0 => power_status_code(o.state),
                1 => o.measured_current_ma,
                2 => battery_mv * i32::from(o.commanded_duty) / 1000,
                3 => i32::from(matches!(o.state, PowerOutputState::On | PowerOutputState::Pwm)),
                _ => i32::from(o.commanded_duty),
            };
        }
        let hbridge_mirror_end = HBRIDGE_MIRROR_BASE + HBRIDGE_COUNT as u16 * MIRROR_FIELD_COUNT;
        if (HBRIDGE_MIRROR_BASE..hbridge_mirror_end).contains(&physical_index) {
            let offset = physical_index - HBRIDGE_MIRROR_BASE;
            let bridge = (offset / MIRROR_FIELD_COUNT) as usize;
            let field = offset % MIRROR_FIELD_COUNT;
            let Some(b) = self.supervisor.hbridges.bridges_iter().nth(bridge) else {
                return 0;
            };
            return match field {
                0 => i32::from(hbridge_mode_byte(b.mode)),
                1 => b.measured_current_ma,
                2 => battery_mv * b.duty / 1000,
                3 => i32::from(b.mode != HBridgeMode::Coast),
                _ => b.duty,
            };
        }
        0
    }
}

/// Output sink for writes that land on physical power/H-bridge outputs
/// or on a virtual channel, dispatched through the supervisor and the
/// logic engine respectively. Used for command-dispatch `SET_OUTPUT`
/// style writes, never from inside `LogicEngine::execute` (it already
/// holds `&mut LogicEngine`, so routing `write_virtual` back into
/// itself here would alias).
pub struct ChannelOutput<'a> {
    pub supervisor: &'a mut Supervisor,
    pub logic: &'a mut LogicEngine,
}

impl<'a> OutputSink for ChannelOutput<'a> {
    fn write_power(&mut self, physical_index: u16, value: i32) -> Result<(), ChannelError> {
        self.supervisor
            .set_state(physical_index as usize, value >= 500)
            .map_err(|_| ChannelError::Disabled)
    }

    fn write_pwm(&mut self, physical_index: u16, value: i32) -> Result<(), ChannelError> {
        self.supervisor
            .set_pwm(physical_index as usize, value.clamp(0, 1000) as u16)
            .map_err(|_| ChannelError::Disabled)
    }

    fn write_hbridge(&mut self, physical_index: u16, value: i32) -> Result<(), ChannelError> {
        let (mode, duty) = hbridge_mode_from_signed(value);
        self.supervisor
            .hbridge_set_mode(physical_index as usize, mode, duty)
            .map_err(|_| ChannelError::Disabled)
    }

    fn write_virtual(&mut self, physical_index: u16, value: i32) -> Result<(), ChannelError> {
        self.logic
            .set_vchannel(physical_index as usize, f64::from(value))
            .map_err(|_| ChannelError::Disabled)
    }
}

/// `value`'s sign picks direction, its magnitude picks duty (DESIGN.md:
/// engine-level policy for how a signed channel value maps onto
/// [`HBridgeMode`], matching how `OutputBinding::HBridgeSigned` already
/// encodes direction in the logic engine).
fn hbridge_mode_from_signed(value: i32) -> (HBridgeMode, i32) {
    if value > 0 {
        (HBridgeMode::Forward, value)
    } else if value < 0 {
        (HBridgeMode::Reverse, value.abs())
    } else {
        (HBridgeMode::Coast, 0)
    }
}

/// Input source used only inside `LogicEngine::execute`'s control tick:
/// board drivers only. The engine's `execute` call already holds `&mut
/// Supervisor` through [`LogicOutput`], so this type must not also name
/// it; a hardware-refresh bound to a `SystemInput`/`CanInput`/
/// `ComputedInput` channel therefore reads as 0 for the duration of a
/// logic tick (DESIGN.md "Design notes worth keeping straight"). Those
/// channels are still refreshed correctly moments earlier in the same
/// control tick by `ChannelRegistry::tick`'s own pass over
/// [`ChannelInput`], which does hold the supervisor.
pub struct LogicInput<'a, A, D> {
    pub analog: &'a mut A,
    pub digital: &'a mut D,
}

impl<'a, A: AnalogInputs, D: DigitalInputs> InputSource for LogicInput<'a, A, D> {
    fn read_analog(&mut self, physical_index: u16) -> i32 {
        self.analog.read_analog(physical_index)
    }
    fn read_digital(&mut self, physical_index: u16) -> i32 {
        self.digital.read_digital(physical_index)
    }
    fn read_frequency(&mut self, physical_index: u16) -> i32 {
        self.digital.read_frequency(physical_index)
    }
    fn read_switch(&mut self, physical_index: u16) -> i32 {
        self.digital.read_switch(physical_index)
    }
}

/// Output sink for the logic engine's own output bindings (spec §4.2
/// step 4): power/PWM/H-bridge only, matching [`pmu_logic::OutputBinding`].
pub struct LogicOutput<'a> {
    pub supervisor: &'a mut Supervisor,
}

impl<'a> OutputSink for LogicOutput<'a> {
    fn write_power(&mut self, physical_index: u16, value: i32) -> Result<(), ChannelError> {
        self.supervisor
            .set_state(physical_index as usize, value >= 500)
            .map_err(|_| ChannelError::Disabled)
    }

    fn write_pwm(&mut self, physical_index: u16, value: i32) -> Result<(), ChannelError> {
        self.supervisor
            .set_pwm(physical_index as usize, value.clamp(0, 1000) as u16)
            .map_err(|_| ChannelError::Disabled)
    }

    fn write_hbridge(&mut self, physical_index: u16, value: i32) -> Result<(), ChannelError> {
        let (mode, duty) = hbridge_mode_from_signed(value);
        self.supervisor
            .hbridge_set_mode(physical_index as usize, mode, duty)
            .map_err(|_| ChannelError::Disabled)
    }
}

/// Feeds the protection snapshot from reserved system-sensor analog
/// indices (spec §4.4 "Protection" task).
pub struct ProtectionBridge<'a, A> {
    pub analog: &'a mut A,
}

impl<'a, A: AnalogInputs> ProtectionDiagnostics for ProtectionBridge<'a, A> {
    fn battery_mv(&mut self) -> i32 {
        self.analog.read_analog(BATTERY_SENSE_INDEX)
    }
    fn mcu_temp_c(&mut self) -> i32 {
        self.analog.read_analog(MCU_TEMP_SENSE_INDEX)
    }
    fn board_temp_l_c(&mut self) -> i32 {
        self.analog.read_analog(BOARD_TEMP_L_SENSE_INDEX)
    }
    fn board_temp_r_c(&mut self) -> i32 {
        self.analog.read_analog(BOARD_TEMP_R_SENSE_INDEX)
    }
}

/// Physical input channel the CAN telemetry encoder reads analog/
/// digital values from (DESIGN.md: a fixed mapping onto the first N
/// registered physical channels, same simplification as `GET_INPUTS`).
pub fn physical_input_id(index: u16) -> ChannelId {
    ChannelId::new(pmu_types::id_range::PHYSICAL_START + index)
}

/// Source for `pmu_protocol::encode_frames` (spec §6, optional CAN
/// telemetry): reads straight out of the supervisor banks and the
/// first registered physical input channels, with no mutation in
/// progress elsewhere, so a plain immutable borrow of both suffices.
pub struct CanBridge<'a> {
    pub supervisor: &'a Supervisor,
    pub channels: &'a ChannelRegistry,
}

impl<'a> CanTelemetrySource for CanBridge<'a> {
    fn output_duty(&mut self, index: usize) -> u8 {
        self.supervisor
            .power
            .outputs_iter()
            .nth(index)
            .map(|o| (o.commanded_duty / 4).min(255) as u8)
            .unwrap_or(0)
    }

    fn analog_input(&mut self, index: usize) -> u16 {
        self.channels
            .channel(physical_input_id(index as u16))
            .map(|c| c.value.clamp(0, i32::from(u16::MAX)) as u16)
            .unwrap_or(0)
    }

    fn output_current_ma(&mut self, index: usize) -> u16 {
        self.supervisor
            .power
            .outputs_iter()
            .nth(index)
            .map(|o| o.measured_current_ma.clamp(0, i32::from(u16::MAX)) as u16)
            .unwrap_or(0)
    }

    fn battery_mv(&mut self) -> u16 {
        self.supervisor.protection.battery_mv.clamp(0, i32::from(u16::MAX)) as u16
    }

    fn board_temp_c(&mut self, side: usize) -> i16 {
        if side == 0 {
            self.supervisor.protection.board_temp_l_c as i16
        } else {
            self.supervisor.protection.board_temp_r_c as i16
        }
    }

    fn digital_input(&mut self, index: usize) -> bool {
        self.channels
            .channel(physical_input_id(100 + index as u16))
            .map(|c| c.value != 0)
            .unwrap_or(false)
    }

    fn hbridge_status(&mut self, bridge: usize) -> (u8, u8) {
        self.supervisor
            .hbridges
            .bridges_iter()
            .nth(bridge)
            .map(|b| (hbridge_mode_byte(b.mode), b.fault_flags.bits()))
            .unwrap_or((0, 0))
    }
}

fn hbridge_mode_byte(mode: HBridgeMode) -> u8 {
    match mode {
        HBridgeMode::Coast => 0,
        HBridgeMode::Forward => 1,
        HBridgeMode::Reverse => 2,
        HBridgeMode::Brake => 3,
        HBridgeMode::WiperPark => 4,
        HBridgeMode::Pid => 5,
    }
}
