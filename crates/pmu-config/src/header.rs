// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The header shape shared by the internal typed record and every
//! external JSON slot (spec §3 "Stored Configuration"): magic, version,
//! length, a CRC32 over the content, a CRC32 over the header itself,
//! and a monotonic write counter used for slot selection.

use crc::{Crc, CRC_32_ISO_HDLC};
use zerocopy::{AsBytes, FromBytes};

/// CRC-32/ISO-HDLC: poly 0x04C11DB7 normal (0xEDB88320 reflected),
/// init 0xFFFFFFFF, reflected in/out, xorout 0xFFFFFFFF — the ordinary
/// "zlib" CRC32 (spec §4.7 names this polynomial explicitly for the
/// bootloader; the config store reuses it for consistency).
pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub fn crc32(bytes: &[u8]) -> u32 {
    CRC32.checksum(bytes)
}

pub const MAGIC_TYPED: u32 = 0x504D_5543; // "PMUC"
pub const MAGIC_JSON: u32 = 0x504D_554A; // "PMUJ"
pub const CURRENT_VERSION: u16 = 1;

/// Fixed-layout record prefixed onto both the typed config sector and
/// each JSON slot. `header_crc` covers every field above it (i.e. not
/// itself); `data_crc` covers the payload that follows the header.
#[derive(Clone, Copy, Debug, FromBytes, AsBytes)]
#[repr(C)]
pub struct ConfigHeader {
    pub magic: u32,
    pub version: u16,
    pub _reserved: u16,
    pub length: u32,
    pub write_count: u32,
    pub data_crc: u32,
    pub header_crc: u32,
}

impl ConfigHeader {
    pub fn new(magic: u32, length: u32, write_count: u32, data_crc: u32) -> Self {
        let mut header = ConfigHeader {
            magic,
            version: CURRENT_VERSION,
            _reserved: 0,
            length,
            write_count,
            data_crc,
            header_crc: 0,
        };
        header.header_crc = crc32(&header.as_bytes()[..20]);
        header
    }

    pub fn is_valid(&self, expected_magic: u32) -> bool {
        if self.magic != expected_magic || self.version != CURRENT_VERSION {
            return false;
        }
        self.header_crc == crc32(&self.as_bytes()[..20])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_bytes() {
        let header = ConfigHeader::new(MAGIC_JSON, 42, 7, 0xDEAD_BEEF);
        let bytes = header.as_bytes().to_vec();
        let parsed = ConfigHeader::read_from(&bytes[..]).unwrap();
        assert!(parsed.is_valid(MAGIC_JSON));
        assert_eq!(parsed.length, 42);
        assert_eq!(parsed.write_count, 7);
    }

    #[test]
    fn corrupt_header_byte_is_detected() {
        let header = ConfigHeader::new(MAGIC_JSON, 42, 7, 0xDEAD_BEEF);
        let mut bytes = header.as_bytes().to_vec();
        bytes[8] ^= 0x01;
        let parsed = ConfigHeader::read_from(&bytes[..]).unwrap();
        assert!(!parsed.is_valid(MAGIC_JSON));
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let header = ConfigHeader::new(MAGIC_TYPED, 0, 0, 0);
        assert!(!header.is_valid(MAGIC_JSON));
    }
}
