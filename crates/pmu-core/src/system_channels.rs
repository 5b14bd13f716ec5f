// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Channels registered at startup rather than from a loaded
//! configuration (spec §3 "channels are registered at startup (system
//! channels) and at configuration load (user channels)"): the four
//! board-sensor `SystemInput` channels and the per-output mirror
//! `ComputedInput` channels `ChannelRegistry::tick` recomputes every
//! control tick (spec §4.1).

use pmu_channels::{ChannelError, ChannelRegistry, ChannelSpec};
use pmu_supervisor::{HBRIDGE_COUNT, POWER_OUTPUT_COUNT};
use pmu_types::{ChannelClass, ChannelFlags, ChannelId, ValueFormat};

use crate::bridge::{self, MirrorField};

const SENSOR_CHANNEL_BASE: u16 = 0;
const POWER_MIRROR_CHANNEL_BASE: u16 = 200;
const HBRIDGE_MIRROR_CHANNEL_BASE: u16 = POWER_MIRROR_CHANNEL_BASE + POWER_OUTPUT_COUNT as u16 * 5;

const MIRROR_FIELDS: [(MirrorField, &str, i32, i32); 5] = [
    (MirrorField::StatusCode, "status", 0, 3),
    (MirrorField::CurrentMa, "current", 0, 30_000),
    (MirrorField::VoltageEstimateMv, "voltage", 0, 20_000),
    (MirrorField::ActiveFlag, "active", 0, 1),
    (MirrorField::Duty, "duty", 0, 1000),
];

fn spec(
    channel_id: u16,
    class: ChannelClass,
    physical_index: u16,
    name: String,
    min: i32,
    max: i32,
) -> ChannelSpec {
    ChannelSpec {
        channel_id: ChannelId::new(channel_id),
        class,
        format: ValueFormat::Raw,
        physical_index,
        name,
        unit: String::new(),
        min,
        max,
        flags: ChannelFlags::ENABLED,
    }
}

/// Registers the fixed system-sensor and output-mirror channels. Called
/// once from `Core::new`, before any stored/loaded configuration is
/// applied, so user configs must pick channel ids outside `0..=3` and
/// `200..370` (DESIGN.md).
pub fn register_system_channels(channels: &mut ChannelRegistry) -> Result<(), ChannelError> {
    for (name, min, max) in [
        ("battery_mv", 0, 20_000),
        ("mcu_temp_c", -40, 150),
        ("board_temp_l_c", -40, 150),
        ("board_temp_r_c", -40, 150),
    ] {
        channels.register(spec(
            SENSOR_CHANNEL_BASE + index_of(name),
            ChannelClass::SystemInput,
            index_of(name),
            name.to_string(),
            min,
            max,
        ))?;
    }

    for output in 0..POWER_OUTPUT_COUNT as u16 {
        for (field_index, (field, suffix, min, max)) in MIRROR_FIELDS.iter().enumerate() {
            channels.register(spec(
                POWER_MIRROR_CHANNEL_BASE + output * 5 + field_index as u16,
                ChannelClass::ComputedInput,
                bridge::power_mirror_index(output, *field),
                format!("power {output} {suffix}"),
                *min,
                *max,
            ))?;
        }
    }

    for bridge_index in 0..HBRIDGE_COUNT as u16 {
        for (field_index, (field, suffix, min, max)) in MIRROR_FIELDS.iter().enumerate() {
            channels.register(spec(
                HBRIDGE_MIRROR_CHANNEL_BASE + bridge_index * 5 + field_index as u16,
                ChannelClass::ComputedInput,
                bridge::hbridge_mirror_index(bridge_index, *field),
                format!("hbridge {bridge_index} {suffix}"),
                *min,
                *max,
            ))?;
        }
    }

    Ok(())
}

fn index_of(name: &str) -> u16 {
    match name {
        "battery_mv" => 0,
        "mcu_temp_c" => 1,
        "board_temp_l_c" => 2,
        "board_temp_r_c" => 3,
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_sensor_and_mirror_channels_without_collision() {
        let mut channels = ChannelRegistry::new();
        register_system_channels(&mut channels).unwrap();
        assert!(channels.channel(ChannelId::new(0)).is_some());
        assert!(channels.channel(ChannelId::new(HBRIDGE_MIRROR_CHANNEL_BASE + 19)).is_some());
    }
}
