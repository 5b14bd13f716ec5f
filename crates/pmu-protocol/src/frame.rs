// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Packet framing (spec §4.5, §6): `START | CMD | LEN_LE(2) | PAYLOAD | CRC16_LE(2)`,
//! CRC-CCITT over every byte from `START` through the last payload byte.

use crc::{Crc, CRC_16_IBM_3740};

pub const START_MARKER: u8 = 0x7E;
pub const MAX_PAYLOAD: usize = 512;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

pub fn crc16(bytes: &[u8]) -> u16 {
    CRC16.checksum(bytes)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub cmd: u8,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(cmd: u8, payload: Vec<u8>) -> Self {
        Packet { cmd, payload }
    }

    /// Encodes this packet into `START|CMD|LEN_LE|PAYLOAD|CRC16_LE`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(6 + self.payload.len());
        buf.push(START_MARKER);
        buf.push(self.cmd);
        buf.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        let crc = crc16(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn ping_encodes_to_spec_bytes() {
        let packet = Packet::new(0x10, vec![0x01, 0x02, 0x03]);
        let bytes = packet.encode();
        let crc = crc16(&[START_MARKER, 0x10, 0x03, 0x00, 0x01, 0x02, 0x03]);
        let mut expected = vec![START_MARKER, 0x10, 0x03, 0x00, 0x01, 0x02, 0x03];
        expected.extend_from_slice(&crc.to_le_bytes());
        assert_eq!(bytes, expected);
    }

    proptest! {
        #[test]
        fn crc_round_trip(payload in proptest::collection::vec(any::<u8>(), 0..64), cmd in any::<u8>()) {
            let packet = Packet::new(cmd, payload.clone());
            let bytes = packet.encode();
            let payload_len = bytes.len() - 6;
            let body_without_crc = &bytes[..bytes.len() - 2];
            let crc_actual = u16::from_le_bytes([bytes[bytes.len() - 2], bytes[bytes.len() - 1]]);
            prop_assert_eq!(crc_actual, crc16(body_without_crc));
            prop_assert_eq!(payload_len, payload.len());
        }
    }
}
