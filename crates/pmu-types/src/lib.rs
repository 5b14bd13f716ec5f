// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Primitive types shared by every PMU core component: the channel
//! identifier space, channel classes and their derived direction, value
//! formats, and the per-mille duty-cycle scale used throughout.

use bitflags::bitflags;

/// Stable 16-bit channel identifier. Unique per registration (spec §3).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(pub u16);

impl ChannelId {
    pub const fn new(id: u16) -> Self {
        ChannelId(id)
    }

    pub const fn get(self) -> u16 {
        self.0
    }
}

impl From<u16> for ChannelId {
    fn from(id: u16) -> Self {
        ChannelId(id)
    }
}

/// Reserved partitions of the channel id space (spec §3).
pub mod id_range {
    use super::ChannelId;

    pub const SYSTEM_START: u16 = 0;
    pub const SYSTEM_END: u16 = 99;
    pub const PHYSICAL_START: u16 = 100;
    pub const PHYSICAL_END: u16 = 999;
    pub const VIRTUAL_START: u16 = 1000;
    pub const VIRTUAL_END: u16 = u16::MAX;

    pub fn is_system(id: ChannelId) -> bool {
        (SYSTEM_START..=SYSTEM_END).contains(&id.get())
    }

    pub fn is_physical(id: ChannelId) -> bool {
        (PHYSICAL_START..=PHYSICAL_END).contains(&id.get())
    }

    pub fn is_virtual(id: ChannelId) -> bool {
        id.get() >= VIRTUAL_START
    }
}

/// The backing driver family for a channel (spec §3).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChannelClass {
    AnalogInput,
    DigitalInput,
    FrequencyInput,
    SwitchInput,
    SystemInput,
    CanInput,
    ComputedInput,
    PowerOutput,
    PwmOutput,
    HbridgeOutput,
    AnalogOutput,
    CanOutput,
    VirtualOutput,
}

/// Input or output, fully derived from `ChannelClass`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl ChannelClass {
    pub fn direction(self) -> Direction {
        use ChannelClass::*;
        match self {
            AnalogInput | DigitalInput | FrequencyInput | SwitchInput | SystemInput
            | CanInput | ComputedInput => Direction::Input,
            PowerOutput | PwmOutput | HbridgeOutput | AnalogOutput | CanOutput
            | VirtualOutput => Direction::Output,
        }
    }

    pub fn is_output(self) -> bool {
        self.direction() == Direction::Output
    }
}

/// Semantic type of a channel's value (spec §3).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ValueFormat {
    Raw,
    VoltageMilliVolts,
    CurrentMilliAmps,
    TemperatureC,
    PerMille,
    Boolean,
    Enum,
}

bitflags! {
    /// Per-channel flags (spec §3): `enabled`, `inverted`.
    #[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
    pub struct ChannelFlags: u8 {
        const ENABLED  = 0b0000_0001;
        const INVERTED = 0b0000_0010;
    }
}

/// Clamp `v` into `[min, max]`. Channels never hold a value outside their
/// configured range (spec §3 invariant: `min <= value <= max`).
pub fn clamp_i32(v: i32, min: i32, max: i32) -> i32 {
    v.clamp(min.min(max), min.max(max))
}

/// Invert a value within `[min, max]`: `max - (v - min)`, i.e. reflect
/// around the range's midpoint rather than assuming `min == 0`.
pub fn invert_i32(v: i32, min: i32, max: i32) -> i32 {
    max - (v - min)
}

/// "Parts per thousand": the canonical duty-cycle scale (spec GLOSSARY).
/// `0..=1000` maps onto `0.0..=100.0%`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct PerMille(u16);

impl PerMille {
    pub const MIN: PerMille = PerMille(0);
    pub const MAX: PerMille = PerMille(1000);

    /// Clamp `v` into `0..=1000`.
    pub fn new(v: i32) -> Self {
        PerMille(v.clamp(0, 1000) as u16)
    }

    pub fn get(self) -> u16 {
        self.0
    }

    pub fn as_fraction(self) -> f32 {
        f32::from(self.0) / 1000.0
    }
}

/// Boolean threshold used throughout the logic engine: operands are
/// "true if > 0.5" (spec §3).
pub fn as_bool(v: f64) -> bool {
    v > 0.5
}

pub fn from_bool(v: bool) -> f64 {
    if v {
        1.0
    } else {
        0.0
    }
}

/// Absolute float tolerance for equality comparisons (spec §3).
pub const EPSILON: f64 = 1e-4;

pub fn nearly_equal(a: f64, b: f64) -> bool {
    (a - b).abs() < EPSILON
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn direction_follows_class() {
        assert_eq!(ChannelClass::AnalogInput.direction(), Direction::Input);
        assert_eq!(ChannelClass::PowerOutput.direction(), Direction::Output);
        assert!(ChannelClass::HbridgeOutput.is_output());
        assert!(!ChannelClass::SwitchInput.is_output());
    }

    #[test]
    fn per_mille_clamps() {
        assert_eq!(PerMille::new(-5).get(), 0);
        assert_eq!(PerMille::new(5000).get(), 1000);
        assert_eq!(PerMille::new(500).get(), 500);
    }

    #[test]
    fn invert_is_involution_over_range() {
        // Inverting twice returns the original value for any v in range.
        for v in [-100, 0, 37, 100] {
            let inverted = invert_i32(v, -100, 100);
            assert_eq!(invert_i32(inverted, -100, 100), v);
        }
    }

    proptest! {
        #[test]
        fn clamp_always_in_range(v in i32::MIN..i32::MAX, a in -1000i32..1000, b in -1000i32..1000) {
            let (lo, hi) = (a.min(b), a.max(b));
            let clamped = clamp_i32(v, lo, hi);
            prop_assert!(clamped >= lo && clamped <= hi);
        }
    }
}
