// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! CAN telemetry frame encoding (spec §6, optional): 16 predefined
//! frames at a configurable `base_id`, frames 0..7 standard, 8..15
//! extended.

pub const CAN_FRAME_COUNT: usize = 16;

#[derive(Copy, Clone, Debug)]
pub struct CanFrame {
    pub id: u32,
    pub extended: bool,
    pub data: [u8; 8],
}

/// Source of the values each frame carries. `pmu-core` implements this
/// over the channel registry and supervisor state; kept as a trait so
/// the encoder has no dependency on either.
pub trait CanTelemetrySource {
    fn output_duty(&mut self, index: usize) -> u8;
    fn analog_input(&mut self, index: usize) -> u16;
    fn output_current_ma(&mut self, index: usize) -> u16;
    fn battery_mv(&mut self) -> u16;
    fn board_temp_c(&mut self, side: usize) -> i16;
    fn digital_input(&mut self, index: usize) -> bool;
    fn hbridge_status(&mut self, bridge: usize) -> (u8, u8);
}

/// Encodes all 16 frames for one transmit cycle (spec §6). Frame
/// layout is an engine-level policy decision: each frame packs 8 bytes
/// of related telemetry, grouped the way the spec's category list
/// orders them (outputs, inputs, currents, voltages, temperatures,
/// digital inputs, H-bridge status).
pub fn encode_frames(base_id: u32, source: &mut dyn CanTelemetrySource) -> [CanFrame; CAN_FRAME_COUNT] {
    let mut frames = [CanFrame { id: 0, extended: false, data: [0; 8] }; CAN_FRAME_COUNT];

    for frame_idx in 0..4usize {
        let mut data = [0u8; 8];
        for lane in 0..8 {
            data[lane] = source.output_duty(frame_idx * 8 + lane);
        }
        frames[frame_idx] = CanFrame { id: base_id + frame_idx as u32, extended: false, data };
    }

    for lane in 0..4 {
        let value = source.analog_input(lane);
        frames[4].data[lane * 2..lane * 2 + 2].copy_from_slice(&value.to_le_bytes());
    }
    frames[4].id = base_id + 4;

    for lane in 0..4 {
        let value = source.output_current_ma(lane);
        frames[5].data[lane * 2..lane * 2 + 2].copy_from_slice(&value.to_le_bytes());
    }
    frames[5].id = base_id + 5;

    let battery = source.battery_mv();
    frames[6].data[0..2].copy_from_slice(&battery.to_le_bytes());
    frames[6].id = base_id + 6;

    let t0 = source.board_temp_c(0);
    let t1 = source.board_temp_c(1);
    frames[7].data[0..2].copy_from_slice(&t0.to_le_bytes());
    frames[7].data[2..4].copy_from_slice(&t1.to_le_bytes());
    frames[7].id = base_id + 7;

    let mut digital_byte = 0u8;
    for lane in 0..8 {
        if source.digital_input(lane) {
            digital_byte |= 1 << lane;
        }
    }
    frames[8] = CanFrame { id: base_id + 0x100, extended: true, data: [digital_byte, 0, 0, 0, 0, 0, 0, 0] };

    for bridge in 0..4usize {
        let (mode, fault_flags) = source.hbridge_status(bridge);
        let frame_idx = 9 + bridge;
        frames[frame_idx] = CanFrame {
            id: base_id + 0x100 + frame_idx as u32,
            extended: true,
            data: [mode, fault_flags, 0, 0, 0, 0, 0, 0],
        };
    }

    for frame_idx in 13..CAN_FRAME_COUNT {
        frames[frame_idx] = CanFrame { id: base_id + 0x100 + frame_idx as u32, extended: true, data: [0; 8] };
    }

    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource;
    impl CanTelemetrySource for FixedSource {
        fn output_duty(&mut self, index: usize) -> u8 {
            index as u8
        }
        fn analog_input(&mut self, _index: usize) -> u16 {
            1000
        }
        fn output_current_ma(&mut self, _index: usize) -> u16 {
            500
        }
        fn battery_mv(&mut self) -> u16 {
            12_000
        }
        fn board_temp_c(&mut self, _side: usize) -> i16 {
            30
        }
        fn digital_input(&mut self, index: usize) -> bool {
            index % 2 == 0
        }
        fn hbridge_status(&mut self, bridge: usize) -> (u8, u8) {
            (bridge as u8, 0)
        }
    }

    #[test]
    fn frames_0_to_3_carry_output_duties() {
        let frames = encode_frames(0x200, &mut FixedSource);
        assert_eq!(frames[0].data, [0, 1, 2, 3, 4, 5, 6, 7]);
        assert!(!frames[0].extended);
    }

    #[test]
    fn extended_frames_use_extended_ids() {
        let frames = encode_frames(0x200, &mut FixedSource);
        for frame in &frames[8..] {
            assert!(frame.extended);
        }
        for frame in &frames[..8] {
            assert!(!frame.extended);
        }
    }
}
