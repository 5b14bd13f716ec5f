// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The JSON shape persisted by `pmu_config::ConfigStore`'s free-form
//! slot and applied to a live `Core` (spec §4.6 "configuration load" /
//! spec §3 "channels are registered at startup (system channels) and
//! at configuration load (user channels)").
//!
//! These are plain DTOs, not the domain types themselves: `pmu-types`/
//! `pmu-channels`/`pmu-logic` stay free of `serde` so the wire format
//! lives entirely at the composition root, matching how `pmu-config`
//! already keeps its typed record (`TypedConfig`) separate from the
//! free-form JSON blob.

use serde::Deserialize;
use thiserror::Error;

use pmu_channels::{ChannelError, ChannelRegistry, ChannelSpec};
use pmu_logic::{HardwareRefresh, LogicEngine, LogicError, LogicFunction, OpKind, OperandSource, OutputBinding, Operation};
use pmu_types::{ChannelClass, ChannelFlags, ChannelId, ValueFormat};

#[derive(Debug, Error)]
pub enum ConfigApplyError {
    #[error("config body is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("channel registration failed: {0}")]
    Channel(#[from] ChannelError),
    #[error("logic function install failed: {0}")]
    Logic(#[from] LogicError),
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    pub channels: Vec<ChannelEntry>,
    pub functions: Vec<FunctionEntry>,
    pub hardware_refreshes: Vec<HardwareRefreshEntry>,
    pub output_bindings: Vec<OutputBindingEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ChannelEntry {
    pub id: u16,
    pub class: ChannelClassDto,
    #[serde(default)]
    pub format: ValueFormatDto,
    #[serde(default)]
    pub physical_index: u16,
    pub name: String,
    #[serde(default)]
    pub unit: String,
    pub min: i32,
    pub max: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub inverted: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Copy, Clone)]
#[serde(rename_all = "snake_case")]
pub enum ChannelClassDto {
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

impl From<ChannelClassDto> for ChannelClass {
    fn from(dto: ChannelClassDto) -> Self {
        match dto {
            ChannelClassDto::AnalogInput => ChannelClass::AnalogInput,
            ChannelClassDto::DigitalInput => ChannelClass::DigitalInput,
            ChannelClassDto::FrequencyInput => ChannelClass::FrequencyInput,
            ChannelClassDto::SwitchInput => ChannelClass::SwitchInput,
            ChannelClassDto::SystemInput => ChannelClass::SystemInput,
            ChannelClassDto::CanInput => ChannelClass::CanInput,
            ChannelClassDto::ComputedInput => ChannelClass::ComputedInput,
            ChannelClassDto::PowerOutput => ChannelClass::PowerOutput,
            ChannelClassDto::PwmOutput => ChannelClass::PwmOutput,
            ChannelClassDto::HbridgeOutput => ChannelClass::HbridgeOutput,
            ChannelClassDto::AnalogOutput => ChannelClass::AnalogOutput,
            ChannelClassDto::CanOutput => ChannelClass::CanOutput,
            ChannelClassDto::VirtualOutput => ChannelClass::VirtualOutput,
        }
    }
}

#[derive(Debug, Deserialize, Copy, Clone, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValueFormatDto {
    #[default]
    Raw,
    VoltageMilliVolts,
    CurrentMilliAmps,
    TemperatureC,
    PerMille,
    Boolean,
    Enum,
}

impl From<ValueFormatDto> for ValueFormat {
    fn from(dto: ValueFormatDto) -> Self {
        match dto {
            ValueFormatDto::Raw => ValueFormat::Raw,
            ValueFormatDto::VoltageMilliVolts => ValueFormat::VoltageMilliVolts,
            ValueFormatDto::CurrentMilliAmps => ValueFormat::CurrentMilliAmps,
            ValueFormatDto::TemperatureC => ValueFormat::TemperatureC,
            ValueFormatDto::PerMille => ValueFormat::PerMille,
            ValueFormatDto::Boolean => ValueFormat::Boolean,
            ValueFormatDto::Enum => ValueFormat::Enum,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct FunctionEntry {
    pub index: usize,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub operations: Vec<OperationEntry>,
}

#[derive(Debug, Deserialize)]
pub struct OperationEntry {
    pub op_kind: OpKindDto,
    #[serde(default = "default_operand")]
    pub a: OperandDto,
    #[serde(default = "default_operand")]
    pub b: OperandDto,
    #[serde(default = "default_operand")]
    pub c: OperandDto,
    pub output: u16,
}

fn default_operand() -> OperandDto {
    OperandDto::Immediate(0.0)
}

#[derive(Debug, Deserialize, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OpKindDto {
    And,
    Or,
    Not,
    Xor,
    Set,
    Reset,
    Gt,
    Lt,
    Eq,
    Neq,
    Gte,
    Lte,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Min,
    Max,
    Abs,
    Clamp,
    EdgeRising,
    EdgeFalling,
    Hysteresis,
    Toggle,
    Count,
}

impl From<OpKindDto> for OpKind {
    fn from(dto: OpKindDto) -> Self {
        match dto {
            OpKindDto::And => OpKind::And,
            OpKindDto::Or => OpKind::Or,
            OpKindDto::Not => OpKind::Not,
            OpKindDto::Xor => OpKind::Xor,
            OpKindDto::Set => OpKind::Set,
            OpKindDto::Reset => OpKind::Reset,
            OpKindDto::Gt => OpKind::Gt,
            OpKindDto::Lt => OpKind::Lt,
            OpKindDto::Eq => OpKind::Eq,
            OpKindDto::Neq => OpKind::Neq,
            OpKindDto::Gte => OpKind::Gte,
            OpKindDto::Lte => OpKind::Lte,
            OpKindDto::Add => OpKind::Add,
            OpKindDto::Sub => OpKind::Sub,
            OpKindDto::Mul => OpKind::Mul,
            OpKindDto::Div => OpKind::Div,
            OpKindDto::Mod => OpKind::Mod,
            OpKindDto::Min => OpKind::Min,
            OpKindDto::Max => OpKind::Max,
            OpKindDto::Abs => OpKind::Abs,
            OpKindDto::Clamp => OpKind::Clamp,
            OpKindDto::EdgeRising => OpKind::EdgeRising,
            OpKindDto::EdgeFalling => OpKind::EdgeFalling,
            OpKindDto::Hysteresis => OpKind::Hysteresis,
            OpKindDto::Toggle => OpKind::Toggle,
            OpKindDto::Count => OpKind::Count,
        }
    }
}

#[derive(Debug, Deserialize, Copy, Clone)]
#[serde(rename_all = "snake_case")]
pub enum OperandDto {
    Channel(u16),
    Immediate(f64),
}

impl From<OperandDto> for OperandSource {
    fn from(dto: OperandDto) -> Self {
        match dto {
            OperandDto::Channel(id) => OperandSource::Channel(ChannelId::new(id)),
            OperandDto::Immediate(v) => OperandSource::Immediate(v),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HardwareRefreshEntry {
    pub channel: u16,
    pub vchan: u16,
    #[serde(default = "default_scale")]
    pub scale: f64,
}

fn default_scale() -> f64 {
    1.0
}

#[derive(Debug, Deserialize)]
pub struct OutputBindingEntry {
    pub vchan: u16,
    pub binding: OutputBindingDto,
}

#[derive(Debug, Deserialize, Copy, Clone)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum OutputBindingDto {
    PowerOnOff { channel: u16 },
    PowerPwm { channel: u16 },
    HBridgeSigned { channel: u16 },
}

impl From<OutputBindingDto> for OutputBinding {
    fn from(dto: OutputBindingDto) -> Self {
        match dto {
            OutputBindingDto::PowerOnOff { channel } => OutputBinding::PowerOnOff {
                channel: ChannelId::new(channel),
            },
            OutputBindingDto::PowerPwm { channel } => OutputBinding::PowerPwm {
                channel: ChannelId::new(channel),
            },
            OutputBindingDto::HBridgeSigned { channel } => OutputBinding::HBridgeSigned {
                channel: ChannelId::new(channel),
            },
        }
    }
}

/// Parses a `LOAD_CONFIG` JSON body (or the blob loaded from
/// `ConfigStore` at boot) and replays it onto `channels`/`logic` via
/// their normal public API (`register`/`install`/`add_hardware_refresh`/
/// `add_output_binding`) — the same calls a human operator would make
/// one at a time, just driven from a stored document instead (spec §3:
/// "channels are registered at startup (system channels) and at
/// configuration load (user channels)").
pub fn apply_runtime_config(
    channels: &mut ChannelRegistry,
    logic: &mut LogicEngine,
    body: &[u8],
) -> Result<(), ConfigApplyError> {
    let config: RuntimeConfig = serde_json::from_slice(body)?;

    for entry in config.channels {
        channels.register(ChannelSpec {
            channel_id: ChannelId::new(entry.id),
            class: entry.class.into(),
            format: entry.format.into(),
            physical_index: entry.physical_index,
            name: entry.name,
            unit: entry.unit,
            min: entry.min,
            max: entry.max,
            flags: channel_flags(entry.enabled, entry.inverted),
        })?;
    }

    for entry in config.functions {
        let operations: Vec<Operation> = entry
            .operations
            .into_iter()
            .map(|op| Operation::new(op.op_kind.into(), op.a.into(), op.b.into(), op.c.into(), op.output))
            .collect();
        let mut function = LogicFunction::new(operations)?;
        function.enabled = entry.enabled;
        logic.install(entry.index, function)?;
    }

    for entry in config.hardware_refreshes {
        logic.add_hardware_refresh(HardwareRefresh {
            channel: ChannelId::new(entry.channel),
            vchan: entry.vchan,
            scale: entry.scale,
        });
    }

    for entry in config.output_bindings {
        logic.add_output_binding(entry.vchan, entry.binding.into());
    }

    Ok(())
}

fn channel_flags(enabled: bool, inverted: bool) -> ChannelFlags {
    let mut flags = ChannelFlags::empty();
    flags.set(ChannelFlags::ENABLED, enabled);
    flags.set(ChannelFlags::INVERTED, inverted);
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applies_a_channel_a_function_and_a_binding() {
        let mut channels = ChannelRegistry::new();
        let mut logic = LogicEngine::new();
        let body = br#"{
            "channels": [
                {"id": 100, "class": "analog_input", "physical_index": 0, "name": "battery", "min": 0, "max": 20000},
                {"id": 1000, "class": "virtual_output", "name": "out0", "min": 0, "max": 1000}
            ],
            "functions": [
                {"index": 0, "operations": [
                    {"op_kind": "set", "a": {"immediate": 1.0}, "output": 1000}
                ]}
            ],
            "hardware_refreshes": [
                {"channel": 100, "vchan": 5, "scale": 1.0}
            ],
            "output_bindings": [
                {"vchan": 1000, "binding": {"kind": "power_on_off", "channel": 1000}}
            ]
        }"#;

        apply_runtime_config(&mut channels, &mut logic, body).unwrap();

        assert!(channels.channel(ChannelId::new(100)).is_some());
        assert!(channels.channel(ChannelId::new(1000)).is_some());
    }

    #[test]
    fn rejects_malformed_json() {
        let mut channels = ChannelRegistry::new();
        let mut logic = LogicEngine::new();
        assert!(apply_runtime_config(&mut channels, &mut logic, b"not json").is_err());
    }
}
