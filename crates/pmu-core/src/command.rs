// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dispatches decoded packets to channel/supervisor/logger/config state
//! and builds the one response the protocol grammar requires per
//! command (spec §4.5). Scripting commands are an explicit Non-goal and
//! always NACK.

use pmu_channels::ChannelError;
use pmu_config::BlockDevice;
use pmu_protocol::{Command, NackReason, Packet, Response, TelemetryFlags, INPUT_COUNT, OUTPUT_COUNT};
use pmu_types::ChannelId;

use crate::bridge::{physical_input_id, ChannelOutput};
use crate::drivers::{AnalogInputs, CanTransport, DigitalInputs, HBridgeDriver, PowerOutputDriver};
use crate::runtime_config::apply_runtime_config;
use crate::{power_state_byte, Core};

fn le_u16(payload: &[u8], at: usize) -> Option<u16> {
    payload.get(at..at + 2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn le_i16(payload: &[u8], at: usize) -> Option<i16> {
    payload.get(at..at + 2).map(|b| i16::from_le_bytes([b[0], b[1]]))
}

fn le_u32(payload: &[u8], at: usize) -> Option<u32> {
    payload.get(at..at + 4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn set_value_response(
    channels: &mut pmu_channels::ChannelRegistry,
    cmd: u8,
    id: ChannelId,
    value: i32,
    output: &mut ChannelOutput,
) -> Response {
    match channels.set_value(id, value, output) {
        Ok(()) => Response::Ack { cmd },
        Err(ChannelError::Missing) => Response::Nack {
            cmd,
            reason: NackReason::ChannelNotFound,
        },
        Err(ChannelError::NotOutput) => Response::Nack {
            cmd,
            reason: NackReason::NotAnOutput,
        },
        Err(ChannelError::Disabled) => Response::Nack {
            cmd,
            reason: NackReason::ChannelDisabled,
        },
        Err(_) => Response::Nack {
            cmd,
            reason: NackReason::MalformedPayload,
        },
    }
}

impl<A, D, P, H, Cn, I, E, L> Core<A, D, P, H, Cn, I, E, L>
where
    A: AnalogInputs,
    D: DigitalInputs,
    P: PowerOutputDriver,
    H: HBridgeDriver,
    Cn: CanTransport,
    I: BlockDevice,
    E: BlockDevice,
    L: BlockDevice,
{
    pub(crate) fn dispatch(&mut self, packet: &Packet, now_ms: u64) -> Response {
        let Some(command) = Command::from_u8(packet.cmd) else {
            return Response::Nack {
                cmd: packet.cmd,
                reason: NackReason::UnknownCommand,
            };
        };
        let cmd = packet.cmd;
        let body = &packet.payload;

        match command {
            Command::Ping => Response::Payload {
                cmd,
                body: body.clone(),
            },
            Command::GetVersion => Response::Payload {
                cmd,
                body: env!("CARGO_PKG_VERSION").as_bytes().to_vec(),
            },
            Command::GetSerial => Response::Payload {
                cmd,
                body: self.typed_config.serial.to_vec(),
            },
            Command::SetOutput => self.dispatch_set_output(cmd, body),
            Command::SetPwm => self.dispatch_set_pwm(cmd, body),
            Command::SetHBridge => self.dispatch_set_hbridge(cmd, body),
            Command::GetOutputs => self.dispatch_get_outputs(cmd),
            Command::GetInputs => self.dispatch_get_inputs(cmd),
            Command::StartStream => self.dispatch_start_stream(cmd, body, now_ms),
            Command::StopStream => {
                self.stream.stop();
                Response::Ack { cmd }
            }
            Command::LoadConfig => self.dispatch_load_config(cmd, body),
            Command::GetConfig => self.dispatch_get_config(cmd),
            Command::SaveConfig => {
                if self.config.store_typed(&self.typed_config).is_err() {
                    Response::Nack {
                        cmd,
                        reason: NackReason::FlashError,
                    }
                } else {
                    Response::Ack { cmd }
                }
            }
            Command::SetChannelConfig => self.dispatch_set_channel_config(cmd, body),
            Command::StartLogging => self.dispatch_start_logging(cmd, body, now_ms),
            Command::StopLogging => {
                if self.logger.stop().is_err() {
                    Response::Nack {
                        cmd,
                        reason: NackReason::Busy,
                    }
                } else {
                    Response::Ack { cmd }
                }
            }
            Command::GetLogInfo => {
                let mut info = Vec::with_capacity(5);
                info.push(self.logger.is_active() as u8);
                info.extend_from_slice(&(self.logger.samples_written() as u32).to_le_bytes());
                Response::Payload { cmd, body: info }
            }
            Command::DownloadLog => self.dispatch_download_log(cmd, body),
            Command::EraseLogs => {
                if self.logger.erase_all().is_err() {
                    Response::Nack {
                        cmd,
                        reason: NackReason::FlashError,
                    }
                } else {
                    Response::Ack { cmd }
                }
            }
            Command::Execute
            | Command::LoadScript
            | Command::UnloadScript
            | Command::RunScript
            | Command::StopScript
            | Command::ListScripts => Response::Nack {
                cmd,
                reason: NackReason::UnknownCommand,
            },
            Command::GetStatus => self.dispatch_get_status(cmd),
            Command::GetOutput => self.dispatch_get_output(cmd, body),
            Command::SetEnabled => self.dispatch_set_enabled(cmd, body),
            Command::Ack | Command::Nack | Command::Data => Response::Nack {
                cmd,
                reason: NackReason::UnknownCommand,
            },
        }
    }

    fn dispatch_set_output(&mut self, cmd: u8, body: &[u8]) -> Response {
        let (Some(id), Some(&on_off)) = (le_u16(body, 0), body.get(2)) else {
            return Response::Nack {
                cmd,
                reason: NackReason::MalformedPayload,
            };
        };
        let mut output = ChannelOutput {
            supervisor: &mut self.supervisor,
            logic: &mut self.logic,
        };
        set_value_response(&mut self.channels, cmd, ChannelId::new(id), if on_off != 0 { 1000 } else { 0 }, &mut output)
    }

    fn dispatch_set_pwm(&mut self, cmd: u8, body: &[u8]) -> Response {
        let (Some(id), Some(duty)) = (le_u16(body, 0), le_u16(body, 2)) else {
            return Response::Nack {
                cmd,
                reason: NackReason::MalformedPayload,
            };
        };
        let mut output = ChannelOutput {
            supervisor: &mut self.supervisor,
            logic: &mut self.logic,
        };
        set_value_response(&mut self.channels, cmd, ChannelId::new(id), i32::from(duty), &mut output)
    }

    /// Direct mode/duty only (spec's optional PID `[target]` tail is not
    /// implemented here, matching the logic engine's own
    /// `OutputBinding::HBridgeSigned` convention of encoding direction in
    /// the value's sign).
    fn dispatch_set_hbridge(&mut self, cmd: u8, body: &[u8]) -> Response {
        let (Some(id), Some(duty)) = (le_u16(body, 0), le_i16(body, 2)) else {
            return Response::Nack {
                cmd,
                reason: NackReason::MalformedPayload,
            };
        };
        let mut output = ChannelOutput {
            supervisor: &mut self.supervisor,
            logic: &mut self.logic,
        };
        set_value_response(&mut self.channels, cmd, ChannelId::new(id), i32::from(duty), &mut output)
    }

    fn dispatch_get_outputs(&self, cmd: u8) -> Response {
        let mut body = Vec::with_capacity(OUTPUT_COUNT * 3);
        for output in self.supervisor.power.outputs_iter().take(OUTPUT_COUNT) {
            body.push(power_state_byte(output.state));
            body.extend_from_slice(&output.commanded_duty.to_le_bytes());
        }
        Response::Payload { cmd, body }
    }

    fn dispatch_get_inputs(&self, cmd: u8) -> Response {
        let mut body = Vec::with_capacity(INPUT_COUNT * 2);
        for index in 0..INPUT_COUNT as u16 {
            let value = self
                .channels
                .channel(physical_input_id(index))
                .map(|c| c.value.clamp(0, i32::from(u16::MAX)) as u16)
                .unwrap_or(0);
            body.extend_from_slice(&value.to_le_bytes());
        }
        Response::Payload { cmd, body }
    }

    fn dispatch_start_stream(&mut self, cmd: u8, body: &[u8], now_ms: u64) -> Response {
        let (Some(&flag_bits), Some(rate_hz)) = (body.first(), le_u16(body, 1)) else {
            return Response::Nack {
                cmd,
                reason: NackReason::MalformedPayload,
            };
        };
        self.stream
            .start(TelemetryFlags::from_bits_truncate(flag_bits), rate_hz, now_ms);
        Response::Ack { cmd }
    }

    /// Persists the raw JSON body, then replays it onto the live
    /// registry/logic engine the same way `Core::new` does at boot
    /// (`runtime_config::apply_runtime_config`): this is the only path
    /// that turns a `LOAD_CONFIG` command into registered channels and
    /// installed logic functions, so a malformed body NACKs even though
    /// the bytes were already durably stored.
    fn dispatch_load_config(&mut self, cmd: u8, body: &[u8]) -> Response {
        if let Err(err) = self.config.store_json(body) {
            tracing::warn!(%err, "load_config: failed to persist body");
            return Response::Nack {
                cmd,
                reason: NackReason::InvalidConfig,
            };
        }
        match apply_runtime_config(&mut self.channels, &mut self.logic, body) {
            Ok(()) => Response::Ack { cmd },
            Err(err) => {
                tracing::warn!(%err, "load_config: stored body failed to apply");
                Response::Nack {
                    cmd,
                    reason: NackReason::InvalidConfig,
                }
            }
        }
    }

    /// Single-chunk response (spec §4.5 names a chunked framing for
    /// larger configs; DESIGN.md: the JSON blob fits comfortably inside
    /// one `MAX_PAYLOAD` frame at this crate's channel-count scale, so
    /// `chunk_idx`/`total_chunks` are always `0`/`1`).
    fn dispatch_get_config(&mut self, cmd: u8) -> Response {
        match self.config.load_json() {
            Ok(json) => {
                let mut body = Vec::with_capacity(4 + json.len());
                body.extend_from_slice(&0u16.to_le_bytes());
                body.extend_from_slice(&1u16.to_le_bytes());
                body.extend_from_slice(&json);
                Response::Payload { cmd, body }
            }
            Err(_) => Response::Nack {
                cmd,
                reason: NackReason::InvalidConfig,
            },
        }
    }

    /// Applies a channel's `enabled` flag from a JSON patch (DESIGN.md:
    /// a simplification — the registry only exposes a runtime
    /// `enabled` toggle beyond registration time, so that is the one
    /// field this command can actually change).
    fn dispatch_set_channel_config(&mut self, cmd: u8, body: &[u8]) -> Response {
        let (Some(id), Some(json_len)) = (le_u16(body, 1), le_u16(body, 3)) else {
            return Response::Nack {
                cmd,
                reason: NackReason::MalformedPayload,
            };
        };
        let Some(json_bytes) = body.get(5..5 + json_len as usize) else {
            return Response::Nack {
                cmd,
                reason: NackReason::MalformedPayload,
            };
        };
        let Ok(patch) = serde_json::from_slice::<serde_json::Value>(json_bytes) else {
            return Response::Nack {
                cmd,
                reason: NackReason::MalformedPayload,
            };
        };
        let Some(enabled) = patch.get("enabled").and_then(|v| v.as_bool()) else {
            return Response::Nack {
                cmd,
                reason: NackReason::MalformedPayload,
            };
        };
        match self.channels.set_enabled(ChannelId::new(id), enabled) {
            Ok(()) => Response::Ack { cmd },
            Err(_) => Response::Nack {
                cmd,
                reason: NackReason::ChannelNotFound,
            },
        }
    }

    fn dispatch_start_logging(&mut self, cmd: u8, body: &[u8], now_ms: u64) -> Response {
        let (Some(session_id), Some(rate_hz), Some(&count)) = (le_u32(body, 0), le_u16(body, 4), body.get(6)) else {
            return Response::Nack {
                cmd,
                reason: NackReason::MalformedPayload,
            };
        };
        let mut ids = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let Some(id) = le_u16(body, 7 + i * 2) else {
                return Response::Nack {
                    cmd,
                    reason: NackReason::MalformedPayload,
                };
            };
            ids.push(id);
        }
        match self.logger.start_session(session_id, now_ms as u32, rate_hz, &ids) {
            Ok(()) => {
                self.log_channels = ids.into_iter().map(ChannelId::new).collect();
                Response::Ack { cmd }
            }
            Err(_) => Response::Nack {
                cmd,
                reason: NackReason::Busy,
            },
        }
    }

    fn dispatch_download_log(&self, cmd: u8, body: &[u8]) -> Response {
        let (Some(offset), Some(length)) = (le_u32(body, 4), le_u16(body, 8)) else {
            return Response::Nack {
                cmd,
                reason: NackReason::MalformedPayload,
            };
        };
        let mut buf = vec![0u8; length as usize];
        match self.logger.read_bytes(offset as usize, &mut buf) {
            Ok(()) => Response::Payload { cmd, body: buf },
            Err(_) => Response::Nack {
                cmd,
                reason: NackReason::FlashError,
            },
        }
    }

    fn dispatch_get_status(&self, cmd: u8) -> Response {
        let mut body = Vec::with_capacity(11);
        body.push(crate::protection_status_byte(self.supervisor.protection.status));
        body.extend_from_slice(
            &(self.supervisor.protection.battery_mv.clamp(0, i32::from(u16::MAX)) as u16).to_le_bytes(),
        );
        body.extend_from_slice(
            &(self.supervisor.protection.total_current_ma.clamp(0, i32::from(u16::MAX)) as u16).to_le_bytes(),
        );
        body.extend_from_slice(&self.scheduler.watchdog.missed_ticks().to_le_bytes());
        Response::Payload { cmd, body }
    }

    fn dispatch_get_output(&self, cmd: u8, body: &[u8]) -> Response {
        let Some(id) = le_u16(body, 0) else {
            return Response::Nack {
                cmd,
                reason: NackReason::MalformedPayload,
            };
        };
        match self.channels.channel(ChannelId::new(id)) {
            Some(channel) => Response::Payload {
                cmd,
                body: channel.value.to_le_bytes().to_vec(),
            },
            None => Response::Nack {
                cmd,
                reason: NackReason::ChannelNotFound,
            },
        }
    }

    fn dispatch_set_enabled(&mut self, cmd: u8, body: &[u8]) -> Response {
        let (Some(id), Some(&enabled)) = (le_u16(body, 0), body.get(2)) else {
            return Response::Nack {
                cmd,
                reason: NackReason::MalformedPayload,
            };
        };
        match self.channels.set_enabled(ChannelId::new(id), enabled != 0) {
            Ok(()) => Response::Ack { cmd },
            Err(_) => Response::Nack {
                cmd,
                reason: NackReason::ChannelNotFound,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimAnalog, SimCan, SimDigital, SimHBridge, SimPower};
    use crate::Drivers;
    use pmu_config::{ConfigStore, SimBlockDevice};
    use pmu_logger::Logger;
    use pmu_types::{ChannelClass, ChannelFlags, ValueFormat};

    type TestCore = Core<SimAnalog, SimDigital, SimPower, SimHBridge, SimCan, SimBlockDevice, SimBlockDevice, SimBlockDevice>;

    fn core() -> TestCore {
        let drivers = Drivers {
            analog: SimAnalog::default(),
            digital: SimDigital::default(),
            power: SimPower::default(),
            hbridge: SimHBridge::default(),
            can: SimCan::default(),
        };
        let config = ConfigStore::new(SimBlockDevice::new(4096), SimBlockDevice::new(8192), 4096);
        let logger = Logger::new(SimBlockDevice::new(4096), 0, 4096);
        Core::new(drivers, config, logger)
    }

    fn register_power_output(core: &mut TestCore, id: u16) {
        core.channels
            .register(pmu_channels::ChannelSpec {
                channel_id: ChannelId::new(id),
                class: ChannelClass::PowerOutput,
                format: ValueFormat::Boolean,
                physical_index: 0,
                name: "out".into(),
                unit: String::new(),
                min: 0,
                max: 1000,
                flags: ChannelFlags::ENABLED,
            })
            .unwrap();
    }

    #[test]
    fn ping_echoes_payload() {
        let mut core = core();
        let packet = Packet::new(Command::Ping as u8, vec![1, 2, 3]);
        let response = core.dispatch(&packet, 0);
        assert_eq!(response, Response::Payload { cmd: Command::Ping as u8, body: vec![1, 2, 3] });
    }

    #[test]
    fn set_output_on_registered_channel_acks() {
        let mut core = core();
        register_power_output(&mut core, 100);
        let mut payload = 100u16.to_le_bytes().to_vec();
        payload.push(1);
        let packet = Packet::new(Command::SetOutput as u8, payload);
        let response = core.dispatch(&packet, 0);
        assert_eq!(response, Response::Ack { cmd: Command::SetOutput as u8 });
        assert_eq!(core.channels.channel(ChannelId::new(100)).unwrap().value, 1000);
    }

    #[test]
    fn set_output_on_missing_channel_nacks() {
        let mut core = core();
        let mut payload = 999u16.to_le_bytes().to_vec();
        payload.push(1);
        let packet = Packet::new(Command::SetOutput as u8, payload);
        let response = core.dispatch(&packet, 0);
        assert_eq!(
            response,
            Response::Nack {
                cmd: Command::SetOutput as u8,
                reason: NackReason::ChannelNotFound
            }
        );
    }

    #[test]
    fn unknown_command_byte_nacks() {
        let mut core = core();
        let packet = Packet::new(0xAB, vec![]);
        let response = core.dispatch(&packet, 0);
        assert_eq!(
            response,
            Response::Nack {
                cmd: 0xAB,
                reason: NackReason::UnknownCommand
            }
        );
    }

    #[test]
    fn scripting_commands_are_out_of_scope() {
        let mut core = core();
        let packet = Packet::new(Command::Execute as u8, vec![]);
        let response = core.dispatch(&packet, 0);
        assert_eq!(
            response,
            Response::Nack {
                cmd: Command::Execute as u8,
                reason: NackReason::UnknownCommand
            }
        );
    }

    #[test]
    fn get_outputs_reports_all_power_banks() {
        let mut core = core();
        let packet = Packet::new(Command::GetOutputs as u8, vec![]);
        let response = core.dispatch(&packet, 0);
        match response {
            Response::Payload { body, .. } => assert_eq!(body.len(), OUTPUT_COUNT * 3),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn start_and_stop_logging_round_trip() {
        let mut core = core();
        let mut payload = 1u32.to_le_bytes().to_vec();
        payload.extend_from_slice(&100u16.to_le_bytes());
        payload.push(0);
        let packet = Packet::new(Command::StartLogging as u8, payload);
        assert_eq!(core.dispatch(&packet, 0), Response::Ack { cmd: Command::StartLogging as u8 });
        assert!(core.logger.is_active());

        let packet = Packet::new(Command::StopLogging as u8, vec![]);
        assert_eq!(core.dispatch(&packet, 10), Response::Ack { cmd: Command::StopLogging as u8 });
        assert!(!core.logger.is_active());
    }

    #[test]
    fn set_enabled_toggles_channel() {
        let mut core = core();
        register_power_output(&mut core, 100);
        let mut payload = 100u16.to_le_bytes().to_vec();
        payload.push(0);
        let packet = Packet::new(Command::SetEnabled as u8, payload);
        assert_eq!(core.dispatch(&packet, 0), Response::Ack { cmd: Command::SetEnabled as u8 });
        assert!(!core.channels.channel(ChannelId::new(100)).unwrap().enabled());
    }
}
