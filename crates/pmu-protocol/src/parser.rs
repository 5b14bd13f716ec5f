// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Byte-driven parser state machine (spec §4.5): `IDLE -> HAVE_START ->
//! HAVE_CMD -> HAVE_LEN -> HAVE_PAYLOAD -> IDLE`, with a per-packet
//! stall timeout.

use crate::frame::{crc16, Packet, MAX_PAYLOAD, START_MARKER};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Idle,
    HaveCmd,
    HaveLen,
    HavePayload,
}

pub struct Parser {
    state: State,
    cmd: u8,
    len: u16,
    len_bytes: [u8; 2],
    len_got: u8,
    payload: Vec<u8>,
    crc_bytes: [u8; 2],
    crc_got: u8,
    frame_bytes: Vec<u8>,
    last_byte_ms: u64,
    stall_timeout_ms: u64,
    max_payload: usize,
    pub rx_error_count: u32,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD, 1_000)
    }
}

impl Parser {
    pub fn new(max_payload: usize, stall_timeout_ms: u64) -> Self {
        Parser {
            state: State::Idle,
            cmd: 0,
            len: 0,
            len_bytes: [0; 2],
            len_got: 0,
            payload: Vec::new(),
            crc_bytes: [0; 2],
            crc_got: 0,
            frame_bytes: Vec::new(),
            last_byte_ms: 0,
            stall_timeout_ms,
            max_payload,
            rx_error_count: 0,
        }
    }

    fn reset(&mut self) {
        self.state = State::Idle;
        self.len_got = 0;
        self.crc_got = 0;
        self.payload.clear();
        self.frame_bytes.clear();
    }

    /// Feeds one received byte. Returns `Some(Packet)` once a complete,
    /// CRC-valid packet has been assembled.
    pub fn feed_byte(&mut self, byte: u8, now_ms: u64) -> Option<Packet> {
        self.last_byte_ms = now_ms;
        match self.state {
            State::Idle => {
                if byte == START_MARKER {
                    self.frame_bytes.clear();
                    self.frame_bytes.push(byte);
                    self.state = State::HaveCmd;
                    self.len_got = 0;
                }
                None
            }
            State::HaveCmd => {
                if self.frame_bytes.len() == 1 {
                    self.cmd = byte;
                    self.frame_bytes.push(byte);
                    None
                } else {
                    self.len_bytes[self.len_got as usize] = byte;
                    self.frame_bytes.push(byte);
                    self.len_got += 1;
                    if self.len_got == 2 {
                        self.len = u16::from_le_bytes(self.len_bytes);
                        if self.len as usize > self.max_payload {
                            self.rx_error_count += 1;
                            self.reset();
                            return None;
                        }
                        self.payload.clear();
                        self.state = if self.len == 0 { State::HavePayload } else { State::HaveLen };
                        self.crc_got = 0;
                    }
                    None
                }
            }
            State::HaveLen => {
                self.payload.push(byte);
                self.frame_bytes.push(byte);
                if self.payload.len() == self.len as usize {
                    self.state = State::HavePayload;
                    self.crc_got = 0;
                }
                None
            }
            State::HavePayload => {
                self.crc_bytes[self.crc_got as usize] = byte;
                self.crc_got += 1;
                if self.crc_got == 2 {
                    let expected = crc16(&self.frame_bytes);
                    let actual = u16::from_le_bytes(self.crc_bytes);
                    let cmd = self.cmd;
                    let payload = std::mem::take(&mut self.payload);
                    self.reset();
                    if expected == actual {
                        return Some(Packet::new(cmd, payload));
                    } else {
                        self.rx_error_count += 1;
                        tracing::debug!("protocol CRC mismatch, dropping packet");
                    }
                }
                None
            }
        }
    }

    /// Called periodically (e.g. by `protocol.pump()`). If the parser
    /// has been mid-packet for longer than the stall timeout with no
    /// new byte, returns to `Idle` and counts an `rx_error`.
    pub fn check_stall(&mut self, now_ms: u64) -> bool {
        if self.state != State::Idle && now_ms.saturating_sub(self.last_byte_ms) >= self.stall_timeout_ms {
            self.reset();
            self.rx_error_count += 1;
            true
        } else {
            false
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == State::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framing_happy_path_decodes_byte_by_byte() {
        let packet = Packet::new(0x10, vec![0x01, 0x02, 0x03]);
        let bytes = packet.encode();
        let mut parser = Parser::default();
        let mut result = None;
        for (i, &b) in bytes.iter().enumerate() {
            result = parser.feed_byte(b, i as u64);
        }
        assert_eq!(result, Some(Packet::new(0x10, vec![0x01, 0x02, 0x03])));
    }

    #[test]
    fn framing_stall_resets_to_idle_and_counts_error() {
        let mut parser = Parser::default();
        let partial = [START_MARKER, 0x10, 0x04, 0x00, 0x01, 0x02];
        for (i, &b) in partial.iter().enumerate() {
            parser.feed_byte(b, i as u64);
        }
        assert!(!parser.is_idle());
        assert!(parser.check_stall(2_000));
        assert!(parser.is_idle());
        assert_eq!(parser.rx_error_count, 1);

        // A subsequent valid packet still decodes correctly.
        let packet = Packet::new(0x20, vec![0xAA]);
        let bytes = packet.encode();
        let mut result = None;
        for (i, &b) in bytes.iter().enumerate() {
            result = parser.feed_byte(b, 3_000 + i as u64);
        }
        assert_eq!(result, Some(Packet::new(0x20, vec![0xAA])));
    }

    #[test]
    fn corrupt_crc_is_dropped_and_counted() {
        let packet = Packet::new(0x10, vec![0x01]);
        let mut bytes = packet.encode();
        *bytes.last_mut().unwrap() ^= 0xFF;
        let mut parser = Parser::default();
        let mut result = None;
        for (i, &b) in bytes.iter().enumerate() {
            result = parser.feed_byte(b, i as u64);
        }
        assert_eq!(result, None);
        assert_eq!(parser.rx_error_count, 1);
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut parser = Parser::new(4, 1_000);
        let header = [START_MARKER, 0x10, 0x05, 0x00];
        for (i, &b) in header.iter().enumerate() {
            parser.feed_byte(b, i as u64);
        }
        assert_eq!(parser.rx_error_count, 1);
        assert!(parser.is_idle());
    }
}
