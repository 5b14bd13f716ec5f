// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The unsolicited streaming `DATA` payload (spec §6): a fixed section
//! order gated by which telemetry groups `START_STREAM` enabled.

use bitflags::bitflags;

bitflags! {
    #[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
    pub struct TelemetryFlags: u8 {
        const OUTPUTS  = 0b0000_0001;
        const INPUTS   = 0b0000_0010;
        const VOLTAGES = 0b0000_0100;
        const TEMPS    = 0b0000_1000;
        const FAULTS   = 0b0001_0000;
    }
}

pub const OUTPUT_COUNT: usize = 30;
pub const INPUT_COUNT: usize = 20;

#[derive(Clone, Debug, Default)]
pub struct DataPayload {
    pub counter: u32,
    pub timestamp_ms: u32,
    pub outputs: Option<[u8; OUTPUT_COUNT]>,
    pub inputs: Option<[u16; INPUT_COUNT]>,
    pub voltages: Option<(u16, u16)>,
    pub temps: Option<(i16, i16)>,
    pub faults: Option<(u8, u8)>,
    pub virtual_channels: Vec<(u16, i32)>,
}

impl DataPayload {
    /// Encodes in the fixed section order from spec §6: counter,
    /// timestamp, then outputs/inputs/voltages/temps/faults (each only
    /// if present), then the virtual-channel tail.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.counter.to_le_bytes());
        buf.extend_from_slice(&self.timestamp_ms.to_le_bytes());
        if let Some(states) = &self.outputs {
            buf.extend_from_slice(states);
        }
        if let Some(values) = &self.inputs {
            for v in values {
                buf.extend_from_slice(&v.to_le_bytes());
            }
        }
        if let Some((battery_mv, total_ma)) = self.voltages {
            buf.extend_from_slice(&battery_mv.to_le_bytes());
            buf.extend_from_slice(&total_ma.to_le_bytes());
        }
        if let Some((mcu_c, board_c)) = self.temps {
            buf.extend_from_slice(&mcu_c.to_le_bytes());
            buf.extend_from_slice(&board_c.to_le_bytes());
        }
        if let Some((status, flags)) = self.faults {
            buf.push(status);
            buf.push(flags);
        }
        buf.extend_from_slice(&(self.virtual_channels.len() as u16).to_le_bytes());
        for (id, value) in &self.virtual_channels {
            buf.extend_from_slice(&id.to_le_bytes());
            buf.extend_from_slice(&value.to_le_bytes());
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_only_enabled_sections() {
        let payload = DataPayload {
            counter: 7,
            timestamp_ms: 1234,
            voltages: Some((12_000, 500)),
            virtual_channels: vec![(1000, 42)],
            ..Default::default()
        };
        let bytes = payload.encode();
        // counter(4) + timestamp(4) + voltages(4) + virt_count(2) + one entry(6)
        assert_eq!(bytes.len(), 4 + 4 + 4 + 2 + 6);
        assert_eq!(&bytes[0..4], &7u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &1234u32.to_le_bytes());
    }

    #[test]
    fn empty_payload_still_carries_virt_count() {
        let payload = DataPayload { counter: 0, timestamp_ms: 0, ..Default::default() };
        let bytes = payload.encode();
        assert_eq!(bytes.len(), 4 + 4 + 2);
    }
}
