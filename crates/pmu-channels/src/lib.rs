// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! C1: the channel registry (spec §4.1). An addressable store of typed
//! signals — physical inputs, physical outputs, and virtual (computed)
//! signals — behind one namespace keyed by `ChannelId`.
//!
//! The registry owns no hardware itself. Reads of input channels and
//! writes to output channels are dispatched through the [`InputSource`]
//! and [`OutputSink`] traits, which the composition root (`pmu-core`)
//! implements by wiring in the supervisor, logic engine, and board
//! drivers. This keeps the registry ignorant of anything chip-specific,
//! matching spec §1's "chip-specific peripheral setup is out of scope".

use std::collections::HashMap;

use pmu_types::{clamp_i32, invert_i32, ChannelClass, ChannelFlags, ChannelId, Direction};
use thiserror::Error;

#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("duplicate channel id")]
    Duplicate,
    #[error("channel id out of its class's reserved range")]
    OutOfRange,
    #[error("channel is not an output")]
    NotOutput,
    #[error("channel is disabled")]
    Disabled,
    #[error("no channel registered with that id")]
    Missing,
}

/// Registration-time description of a channel (spec §3).
#[derive(Clone, Debug)]
pub struct ChannelSpec {
    pub channel_id: ChannelId,
    pub class: ChannelClass,
    pub format: pmu_types::ValueFormat,
    pub physical_index: u16,
    pub name: String,
    pub unit: String,
    pub min: i32,
    pub max: i32,
    pub flags: ChannelFlags,
}

/// A live, registered channel. `value` is the cache: for inputs it is
/// refreshed by [`ChannelRegistry::tick`]; for outputs it is the last
/// accepted command.
#[derive(Clone, Debug)]
pub struct Channel {
    pub spec: ChannelSpec,
    pub value: i32,
}

impl Channel {
    pub fn direction(&self) -> Direction {
        self.spec.class.direction()
    }

    pub fn enabled(&self) -> bool {
        self.spec.flags.contains(ChannelFlags::ENABLED)
    }

    pub fn inverted(&self) -> bool {
        self.spec.flags.contains(ChannelFlags::INVERTED)
    }
}

/// Dispatch target for refreshing input channel caches. Implemented by
/// the composition root over whatever board drivers or simulation
/// backends are in play; every method is infallible because a stalled or
/// missing sensor reads as its last value (spec §7: transient I/O errors
/// never reach channel reads).
pub trait InputSource {
    fn read_analog(&mut self, physical_index: u16) -> i32 {
        let _ = physical_index;
        0
    }
    fn read_digital(&mut self, physical_index: u16) -> i32 {
        let _ = physical_index;
        0
    }
    fn read_frequency(&mut self, physical_index: u16) -> i32 {
        let _ = physical_index;
        0
    }
    fn read_switch(&mut self, physical_index: u16) -> i32 {
        let _ = physical_index;
        0
    }
    fn read_system(&mut self, physical_index: u16) -> i32 {
        let _ = physical_index;
        0
    }
    fn read_can(&mut self, physical_index: u16) -> i32 {
        let _ = physical_index;
        0
    }
    fn read_computed(&mut self, physical_index: u16) -> i32 {
        let _ = physical_index;
        0
    }
}

/// Dispatch target for output channel writes (spec §4.1: "Dispatch is
/// table-driven by class"). `value` is already clamped and inverted by
/// the registry before it reaches here.
pub trait OutputSink {
    fn write_power(&mut self, physical_index: u16, value: i32) -> Result<(), ChannelError> {
        let _ = (physical_index, value);
        Ok(())
    }
    fn write_pwm(&mut self, physical_index: u16, value: i32) -> Result<(), ChannelError> {
        let _ = (physical_index, value);
        Ok(())
    }
    fn write_hbridge(&mut self, physical_index: u16, value: i32) -> Result<(), ChannelError> {
        let _ = (physical_index, value);
        Ok(())
    }
    fn write_analog(&mut self, physical_index: u16, value: i32) -> Result<(), ChannelError> {
        let _ = (physical_index, value);
        Ok(())
    }
    fn write_can(&mut self, physical_index: u16, value: i32) -> Result<(), ChannelError> {
        let _ = (physical_index, value);
        Ok(())
    }
    fn write_virtual(&mut self, physical_index: u16, value: i32) -> Result<(), ChannelError> {
        let _ = (physical_index, value);
        Ok(())
    }
}

/// A no-op backend, useful for registering channels before drivers exist
/// and in unit tests that only exercise the registry's bookkeeping.
#[derive(Default)]
pub struct NullBackend;
impl InputSource for NullBackend {}
impl OutputSink for NullBackend {}

pub struct ChannelRegistry {
    channels: HashMap<ChannelId, Channel>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        ChannelRegistry {
            channels: HashMap::new(),
        }
    }

    /// Insert by `channel_id`. At most one registration per id (spec §3).
    pub fn register(&mut self, spec: ChannelSpec) -> Result<(), ChannelError> {
        if self.channels.contains_key(&spec.channel_id) {
            return Err(ChannelError::Duplicate);
        }
        let value = clamp_i32(0, spec.min, spec.max);
        tracing::debug!(id = spec.channel_id.get(), name = %spec.name, "channel registered");
        self.channels.insert(spec.channel_id, Channel { spec, value });
        Ok(())
    }

    pub fn unregister(&mut self, id: ChannelId) -> Option<Channel> {
        self.channels.remove(&id)
    }

    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    /// For input channels, dispatch to the backing driver and refresh
    /// the cache; for output channels, return the cached last-commanded
    /// value. Disabled or missing channels read as 0 (spec §4.1).
    pub fn get_value(&mut self, id: ChannelId, input: &mut dyn InputSource) -> i32 {
        let Some(channel) = self.channels.get_mut(&id) else {
            return 0;
        };
        if !channel.enabled() {
            return 0;
        }
        if channel.direction() == Direction::Input {
            let raw = dispatch_read(channel.spec.class, channel.spec.physical_index, input);
            let clamped = clamp_i32(raw, channel.spec.min, channel.spec.max);
            channel.value = clamped;
        }
        if channel.inverted() {
            invert_i32(channel.value, channel.spec.min, channel.spec.max)
        } else {
            channel.value
        }
    }

    /// Clamp to `[min, max]`; if inverted, substitute `max - v` before
    /// caching so the stored value always reflects the physical sense,
    /// then dispatch by class (spec §4.1).
    pub fn set_value(
        &mut self,
        id: ChannelId,
        v: i32,
        output: &mut dyn OutputSink,
    ) -> Result<(), ChannelError> {
        let channel = self.channels.get_mut(&id).ok_or(ChannelError::Missing)?;
        if channel.direction() != Direction::Output {
            return Err(ChannelError::NotOutput);
        }
        if !channel.enabled() {
            return Err(ChannelError::Disabled);
        }
        let clamped = clamp_i32(v, channel.spec.min, channel.spec.max);
        let stored = if channel.inverted() {
            invert_i32(clamped, channel.spec.min, channel.spec.max)
        } else {
            clamped
        };
        channel.value = stored;
        let class = channel.spec.class;
        let physical_index = channel.spec.physical_index;
        dispatch_write(class, physical_index, stored, output)
    }

    /// Internal variant used by the scheduler to refresh **input** caches
    /// without invoking a driver write (spec §4.1), e.g. a board-temp
    /// reading pushed in from the protection task's own sample.
    pub fn update_value(&mut self, id: ChannelId, v: i32) -> Result<(), ChannelError> {
        let channel = self.channels.get_mut(&id).ok_or(ChannelError::Missing)?;
        if channel.direction() != Direction::Input {
            return Err(ChannelError::NotOutput);
        }
        channel.value = clamp_i32(v, channel.spec.min, channel.spec.max);
        Ok(())
    }

    /// Flip a channel's `ENABLED` flag at runtime (spec §4.5 `SET_ENABLED`).
    pub fn set_enabled(&mut self, id: ChannelId, enabled: bool) -> Result<(), ChannelError> {
        let channel = self.channels.get_mut(&id).ok_or(ChannelError::Missing)?;
        channel.spec.flags.set(ChannelFlags::ENABLED, enabled);
        Ok(())
    }

    /// Linear scan acceptable at this cardinality (spec §4.1). Also
    /// backs the `"Button %d"` keypad auto-discovery contract (spec §9
    /// Open Question 3): a keypad producer calls this with names like
    /// `"Button 3"` to resolve the virtual channel it should drive.
    pub fn lookup_by_name(&self, name: &str) -> Option<ChannelId> {
        self.channels
            .values()
            .find(|c| c.enabled() && c.spec.name == name)
            .map(|c| c.spec.channel_id)
    }

    /// Refreshes every enabled input-direction channel, dispatched by
    /// class through `InputSource`. System inputs (`SystemInput`) and
    /// the output sub-channels that mirror supervisor state (status
    /// code, current, voltage estimate, active flag, duty) are both
    /// ordinary input-direction channels here — `ComputedInput` is
    /// `Direction::Input` too — so a single pass covers spec §4.1's
    /// "refreshes system inputs... and recomputes all output
    /// sub-channels... that mirror supervisor state" as long as the
    /// composition root registers those mirror channels and implements
    /// `read_computed` to decode them (see `pmu-core::system_channels`
    /// and `pmu-core::bridge`). Invoked once per control tick by the
    /// scheduler (spec §4.1, §4.4).
    pub fn tick(&mut self, input: &mut dyn InputSource) {
        for channel in self.channels.values_mut() {
            if !channel.enabled() {
                continue;
            }
            if channel.spec.class.direction() == Direction::Input {
                let raw = dispatch_read(channel.spec.class, channel.spec.physical_index, input);
                channel.value = clamp_i32(raw, channel.spec.min, channel.spec.max);
            }
        }
    }
}

fn dispatch_read(class: ChannelClass, physical_index: u16, input: &mut dyn InputSource) -> i32 {
    use ChannelClass::*;
    match class {
        AnalogInput => input.read_analog(physical_index),
        DigitalInput => input.read_digital(physical_index),
        FrequencyInput => input.read_frequency(physical_index),
        SwitchInput => input.read_switch(physical_index),
        SystemInput => input.read_system(physical_index),
        CanInput => input.read_can(physical_index),
        ComputedInput => input.read_computed(physical_index),
        _ => 0,
    }
}

fn dispatch_write(
    class: ChannelClass,
    physical_index: u16,
    value: i32,
    output: &mut dyn OutputSink,
) -> Result<(), ChannelError> {
    use ChannelClass::*;
    match class {
        PowerOutput => output.write_power(physical_index, value),
        PwmOutput => output.write_pwm(physical_index, value),
        HbridgeOutput => output.write_hbridge(physical_index, value),
        AnalogOutput => output.write_analog(physical_index, value),
        CanOutput => output.write_can(physical_index, value),
        VirtualOutput => output.write_virtual(physical_index, value),
        _ => Err(ChannelError::NotOutput),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmu_types::ValueFormat;

    fn spec(id: u16, class: ChannelClass, name: &str, min: i32, max: i32) -> ChannelSpec {
        ChannelSpec {
            channel_id: ChannelId::new(id),
            class,
            format: ValueFormat::Raw,
            physical_index: 0,
            name: name.into(),
            unit: String::new(),
            min,
            max,
            flags: ChannelFlags::ENABLED,
        }
    }

    #[test]
    fn duplicate_registration_rejected() {
        let mut reg = ChannelRegistry::new();
        reg.register(spec(1, ChannelClass::AnalogInput, "a", 0, 100))
            .unwrap();
        assert_eq!(
            reg.register(spec(1, ChannelClass::AnalogInput, "a2", 0, 100)),
            Err(ChannelError::Duplicate)
        );
    }

    #[test]
    fn set_value_clamps_to_range() {
        let mut reg = ChannelRegistry::new();
        reg.register(spec(1, ChannelClass::PowerOutput, "out", 0, 1000))
            .unwrap();
        let mut sink = NullBackend;
        reg.set_value(ChannelId::new(1), 5000, &mut sink).unwrap();
        let mut source = NullBackend;
        assert_eq!(reg.get_value(ChannelId::new(1), &mut source), 1000);
    }

    #[test]
    fn inverted_write_then_read_returns_original() {
        let mut reg = ChannelRegistry::new();
        let mut s = spec(1, ChannelClass::PowerOutput, "out", 0, 1000);
        s.flags |= ChannelFlags::INVERTED;
        reg.register(s).unwrap();
        let mut sink = NullBackend;
        reg.set_value(ChannelId::new(1), 300, &mut sink).unwrap();
        let mut source = NullBackend;
        assert_eq!(reg.get_value(ChannelId::new(1), &mut source), 300);
    }

    #[test]
    fn disabled_channel_reads_zero() {
        let mut reg = ChannelRegistry::new();
        let mut s = spec(1, ChannelClass::AnalogInput, "a", 0, 100);
        s.flags.remove(ChannelFlags::ENABLED);
        reg.register(s).unwrap();
        let mut source = NullBackend;
        assert_eq!(reg.get_value(ChannelId::new(1), &mut source), 0);
    }

    #[test]
    fn missing_channel_reads_zero_and_rejects_write() {
        let mut reg = ChannelRegistry::new();
        let mut source = NullBackend;
        assert_eq!(reg.get_value(ChannelId::new(99), &mut source), 0);
        let mut sink = NullBackend;
        assert_eq!(
            reg.set_value(ChannelId::new(99), 1, &mut sink),
            Err(ChannelError::Missing)
        );
    }

    #[test]
    fn set_value_on_input_channel_rejected() {
        let mut reg = ChannelRegistry::new();
        reg.register(spec(1, ChannelClass::AnalogInput, "a", 0, 100))
            .unwrap();
        let mut sink = NullBackend;
        assert_eq!(
            reg.set_value(ChannelId::new(1), 1, &mut sink),
            Err(ChannelError::NotOutput)
        );
    }

    #[test]
    fn set_enabled_toggles_read_behavior() {
        let mut reg = ChannelRegistry::new();
        reg.register(spec(1, ChannelClass::AnalogInput, "a", 0, 100))
            .unwrap();
        reg.set_enabled(ChannelId::new(1), false).unwrap();
        let mut source = NullBackend;
        assert_eq!(reg.get_value(ChannelId::new(1), &mut source), 0);
        reg.set_enabled(ChannelId::new(1), true).unwrap();
        assert!(reg.channel(ChannelId::new(1)).unwrap().enabled());
    }

    #[test]
    fn lookup_by_name_supports_button_contract() {
        let mut reg = ChannelRegistry::new();
        reg.register(spec(
            1000,
            ChannelClass::VirtualOutput,
            &format!("Button {}", 3),
            0,
            1,
        ))
        .unwrap();
        assert_eq!(reg.lookup_by_name("Button 3"), Some(ChannelId::new(1000)));
        assert_eq!(reg.lookup_by_name("Button 4"), None);
    }

    struct CountingInput {
        reads: u32,
    }
    impl InputSource for CountingInput {
        fn read_analog(&mut self, _physical_index: u16) -> i32 {
            self.reads += 1;
            42
        }
    }

    #[test]
    fn tick_refreshes_input_cache() {
        let mut reg = ChannelRegistry::new();
        reg.register(spec(1, ChannelClass::AnalogInput, "a", 0, 100))
            .unwrap();
        let mut input = CountingInput { reads: 0 };
        reg.tick(&mut input);
        assert_eq!(input.reads, 1);
        assert_eq!(reg.channel(ChannelId::new(1)).unwrap().value, 42);
    }

    struct MirrorInput;
    impl InputSource for MirrorInput {
        fn read_computed(&mut self, physical_index: u16) -> i32 {
            // Stands in for pmu-core's real `read_computed`, which
            // decodes `physical_index` into an output's mirrored
            // supervisor state (status code, current, voltage
            // estimate, active flag, duty).
            i32::from(physical_index) * 10
        }
    }

    #[test]
    fn tick_refreshes_computed_output_mirror_channels() {
        let mut reg = ChannelRegistry::new();
        let mut s = spec(1000, ChannelClass::ComputedInput, "power 0 status", 0, 1000);
        s.physical_index = 7;
        reg.register(s).unwrap();
        let mut input = MirrorInput;
        reg.tick(&mut input);
        assert_eq!(reg.channel(ChannelId::new(1000)).unwrap().value, 70);
    }

    use proptest::prelude::*;

    proptest! {
        // Channel clamp (spec §8): after any accepted set_value, min <= get_value <= max.
        #[test]
        fn set_value_always_clamps_into_range(raw in i32::MIN..i32::MAX, a in -10_000i32..10_000, b in -10_000i32..10_000) {
            let (min, max) = (a.min(b), a.max(b));
            let mut reg = ChannelRegistry::new();
            reg.register(spec(1, ChannelClass::PowerOutput, "out", min, max)).unwrap();
            let mut sink = NullBackend;
            reg.set_value(ChannelId::new(1), raw, &mut sink).unwrap();
            let mut source = NullBackend;
            let v = reg.get_value(ChannelId::new(1), &mut source);
            prop_assert!(v >= min && v <= max);
        }

        // Inversion symmetry (spec §8): for an inverted channel, set then get returns v.
        #[test]
        fn inverted_channel_round_trips_value(v in -500i32..500, a in -1000i32..1000, b in -1000i32..1000) {
            let (min, max) = (a.min(b), a.max(b));
            prop_assume!(v >= min && v <= max);
            let mut reg = ChannelRegistry::new();
            let mut s = spec(1, ChannelClass::PowerOutput, "out", min, max);
            s.flags |= ChannelFlags::INVERTED;
            reg.register(s).unwrap();
            let mut sink = NullBackend;
            reg.set_value(ChannelId::new(1), v, &mut sink).unwrap();
            let mut source = NullBackend;
            prop_assert_eq!(reg.get_value(ChannelId::new(1), &mut source), v);
        }
    }
}
