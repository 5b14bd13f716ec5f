// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory board-driver backends satisfying `drivers`'s traits, used
//! by this crate's own tests and by `pmu-firmware`'s default build
//! (spec §1: chip-specific peripheral setup is explicitly out of
//! scope, so this crate only ever needs a host-simulable stand-in).

use std::collections::HashMap;

use pmu_protocol::CanFrame;
use pmu_supervisor::{HBridgeDiagnostics, HBridgeMode, PowerDiagnostics};

use crate::drivers::{AnalogInputs, CanTransport, DigitalInputs, HBridgeDriver, PowerOutputDriver};

/// A settable analog input backend: values default to 0 and are pushed
/// in by test code or a host harness via `set`.
#[derive(Default)]
pub struct SimAnalog {
    values: HashMap<u16, i32>,
}

impl SimAnalog {
    pub fn set(&mut self, physical_index: u16, value: i32) {
        self.values.insert(physical_index, value);
    }
}

impl AnalogInputs for SimAnalog {
    fn read_analog(&mut self, physical_index: u16) -> i32 {
        self.values.get(&physical_index).copied().unwrap_or(0)
    }
}

#[derive(Default)]
pub struct SimDigital {
    digital: HashMap<u16, i32>,
    frequency: HashMap<u16, i32>,
    switch: HashMap<u16, i32>,
}

impl SimDigital {
    pub fn set_digital(&mut self, physical_index: u16, value: i32) {
        self.digital.insert(physical_index, value);
    }

    pub fn set_frequency(&mut self, physical_index: u16, value: i32) {
        self.frequency.insert(physical_index, value);
    }

    pub fn set_switch(&mut self, physical_index: u16, value: i32) {
        self.switch.insert(physical_index, value);
    }
}

impl DigitalInputs for SimDigital {
    fn read_digital(&mut self, physical_index: u16) -> i32 {
        self.digital.get(&physical_index).copied().unwrap_or(0)
    }

    fn read_frequency(&mut self, physical_index: u16) -> i32 {
        self.frequency.get(&physical_index).copied().unwrap_or(0)
    }

    fn read_switch(&mut self, physical_index: u16) -> i32 {
        self.switch.get(&physical_index).copied().unwrap_or(0)
    }
}

/// PROFET register stand-in: diagnostics default benign (no fault, no
/// measured heat), and every commanded duty is just recorded.
#[derive(Default)]
pub struct SimPower {
    pub written_duty: HashMap<usize, u16>,
}

impl PowerDiagnostics for SimPower {}

impl PowerOutputDriver for SimPower {
    fn write_duty(&mut self, index: usize, duty_per_mille: u16) {
        self.written_duty.insert(index, duty_per_mille);
    }
}

#[derive(Default)]
pub struct SimHBridge {
    pub written: HashMap<usize, (HBridgeMode, i32)>,
}

impl HBridgeDiagnostics for SimHBridge {}

impl HBridgeDriver for SimHBridge {
    fn write(&mut self, index: usize, mode: HBridgeMode, duty: i32) {
        self.written.insert(index, (mode, duty));
    }
}

/// A CAN controller stand-in: `transmitted` records every outbound
/// frame for test inspection, while `receive` drains a separate
/// `inbound` queue a test harness can seed — kept apart so transmitting
/// telemetry doesn't loop back into the (out-of-scope) reception path.
#[derive(Default)]
pub struct SimCan {
    pub transmitted: Vec<CanFrame>,
    inbound: std::collections::VecDeque<CanFrame>,
}

impl SimCan {
    pub fn push_inbound(&mut self, frame: CanFrame) {
        self.inbound.push_back(frame);
    }
}

impl CanTransport for SimCan {
    fn transmit(&mut self, frame: CanFrame) {
        self.transmitted.push(frame);
    }

    fn receive(&mut self) -> Option<CanFrame> {
        self.inbound.pop_front()
    }
}
