// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! C5: the command protocol (spec §4.5, §6) — packet framing, the
//! byte-driven parser, the command/response vocabulary, streaming
//! telemetry payloads, and the optional CAN frame encoder.

pub mod can;
pub mod command;
pub mod frame;
pub mod parser;
pub mod telemetry;

pub use can::{encode_frames, CanFrame, CanTelemetrySource, CAN_FRAME_COUNT};
pub use command::{Command, NackReason, Response};
pub use frame::{crc16, Packet, MAX_PAYLOAD, START_MARKER};
pub use parser::Parser;
pub use telemetry::{DataPayload, TelemetryFlags, INPUT_COUNT, OUTPUT_COUNT};
