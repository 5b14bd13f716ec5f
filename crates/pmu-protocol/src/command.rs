// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The command set (spec §4.5) and the response grammar: every command
//! yields exactly one of ACK, NACK(reason), or a domain-specific
//! response; streaming DATA packets are unsolicited.

use crate::frame::Packet;

macro_rules! commands {
    ($($name:ident = $value:expr),+ $(,)?) => {
        #[derive(Copy, Clone, Debug, PartialEq, Eq)]
        #[repr(u8)]
        pub enum Command {
            $($name = $value),+
        }

        impl Command {
            pub fn from_u8(v: u8) -> Option<Self> {
                match v {
                    $($value => Some(Command::$name),)+
                    _ => None,
                }
            }
        }
    };
}

commands! {
    Ping = 0x01,
    GetVersion = 0x02,
    GetSerial = 0x03,
    SetOutput = 0x10,
    SetPwm = 0x11,
    SetHBridge = 0x12,
    GetOutputs = 0x13,
    GetInputs = 0x14,
    StartStream = 0x20,
    StopStream = 0x21,
    Data = 0x22,
    LoadConfig = 0x30,
    GetConfig = 0x31,
    SaveConfig = 0x32,
    SetChannelConfig = 0x33,
    StartLogging = 0x40,
    StopLogging = 0x41,
    GetLogInfo = 0x42,
    DownloadLog = 0x43,
    EraseLogs = 0x44,
    Execute = 0x50,
    LoadScript = 0x51,
    UnloadScript = 0x52,
    RunScript = 0x53,
    StopScript = 0x54,
    ListScripts = 0x55,
    GetStatus = 0x56,
    GetOutput = 0x57,
    SetEnabled = 0x58,
    Ack = 0xF0,
    Nack = 0xF1,
}

macro_rules! nack_reasons {
    ($($name:ident = $value:expr => $text:expr),+ $(,)?) => {
        #[derive(Copy, Clone, Debug, PartialEq, Eq)]
        #[repr(u8)]
        pub enum NackReason {
            $($name = $value),+
        }

        impl NackReason {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(NackReason::$name => $text),+
                }
            }
        }
    };
}

nack_reasons! {
    UnknownCommand = 0 => "unknown command",
    MalformedPayload = 1 => "malformed payload",
    ChannelNotFound = 2 => "channel not found",
    NotAnOutput = 3 => "channel is not an output",
    ChannelDisabled = 4 => "channel is disabled",
    FlashError = 5 => "flash operation failed",
    CrcMismatch = 6 => "CRC mismatch",
    Busy = 7 => "device busy",
    Locked = 8 => "output locked pending explicit clear",
    InvalidConfig = 9 => "configuration rejected",
}

/// Exactly one of these is produced per inbound command (spec §4.5
/// "Response grammar").
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Ack { cmd: u8 },
    Nack { cmd: u8, reason: NackReason },
    Payload { cmd: u8, body: Vec<u8> },
}

impl Response {
    pub fn encode(&self) -> Packet {
        match self {
            Response::Ack { cmd } => Packet::new(Command::Ack as u8, vec![*cmd]),
            Response::Nack { cmd, reason } => {
                let mut body = vec![*cmd, *reason as u8];
                body.extend_from_slice(reason.as_str().as_bytes());
                Packet::new(Command::Nack as u8, body)
            }
            Response::Payload { cmd, body } => Packet::new(*cmd, body.clone()),
        }
    }
}
