// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Board-driver trait boundaries (spec §1: "chip-specific peripheral
//! setup is out of scope"). `Core` is generic over these so a real
//! board's ADC/GPIO/PWM/CAN register code plugs in without this crate
//! knowing anything about a chip.

use pmu_supervisor::{HBridgeDiagnostics, HBridgeMode, PowerDiagnostics};

/// Analog-to-digital conversion results, addressed by the ADC channel
/// index a board wires a sensor to (not a [`pmu_types::ChannelId`]).
pub trait AnalogInputs {
    fn read_analog(&mut self, physical_index: u16) -> i32;
}

/// Digital, frequency, and switch-contact inputs.
pub trait DigitalInputs {
    fn read_digital(&mut self, physical_index: u16) -> i32;
    fn read_frequency(&mut self, physical_index: u16) -> i32;
    fn read_switch(&mut self, physical_index: u16) -> i32;
}

/// PROFET high-side driver register access: diagnostics plus the duty
/// write a board performs once the supervisor has decided on a value.
pub trait PowerOutputDriver: PowerDiagnostics {
    fn write_duty(&mut self, index: usize, duty_per_mille: u16);
}

/// H-bridge register access: diagnostics plus the mode/duty write.
pub trait HBridgeDriver: HBridgeDiagnostics {
    fn write(&mut self, index: usize, mode: HBridgeMode, duty: i32);
}

/// A CAN controller's frame queues (spec §6, optional telemetry).
pub trait CanTransport {
    fn transmit(&mut self, frame: pmu_protocol::CanFrame);
    fn receive(&mut self) -> Option<pmu_protocol::CanFrame>;
}

/// The full set of board drivers `Core` is generic over.
pub struct Drivers<A, D, P, H, Cn> {
    pub analog: A,
    pub digital: D,
    pub power: P,
    pub hbridge: H,
    pub can: Cn,
}
