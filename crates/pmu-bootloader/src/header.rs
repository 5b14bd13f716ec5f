// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-layout records read at boot time (spec §3, §4.7): the
//! application/backup firmware header, the update-staging header, and
//! the battery-backed shared state carried across a reset.

use pmu_config::crc32;
use zerocopy::{AsBytes, FromBytes};

pub const FIRMWARE_MAGIC: u32 = 0x504D_5546; // "PMUF"
pub const UPDATE_MAGIC: u32 = 0x504D_5550; // "PMUP"
pub const SHARED_MAGIC: u32 = 0x504D_5553; // "PMUS"

pub const UPDATE_STATUS_PENDING: u8 = 0;
pub const UPDATE_STATUS_APPLIED: u8 = 1;
pub const UPDATE_STATUS_FAILED: u8 = 2;

/// Spec §3 "Firmware Header": present at the start of both the
/// application and backup regions.
#[derive(Clone, Copy, Debug, FromBytes, AsBytes)]
#[repr(C)]
pub struct FirmwareHeader {
    pub magic: u32,
    pub version_major: u8,
    pub version_minor: u8,
    pub version_patch: u8,
    pub version_build: u8,
    pub vector_table_addr: u32,
    pub app_size: u32,
    pub app_crc32: u32,
    pub header_crc32: u32,
}

impl FirmwareHeader {
    pub fn new(version: (u8, u8, u8, u8), vector_table_addr: u32, app_size: u32, app_crc32: u32) -> Self {
        let mut header = FirmwareHeader {
            magic: FIRMWARE_MAGIC,
            version_major: version.0,
            version_minor: version.1,
            version_patch: version.2,
            version_build: version.3,
            vector_table_addr,
            app_size,
            app_crc32,
            header_crc32: 0,
        };
        header.header_crc32 = crc32(&header.as_bytes()[..20]);
        header
    }

    pub fn is_valid(&self) -> bool {
        self.magic == FIRMWARE_MAGIC && self.header_crc32 == crc32(&self.as_bytes()[..20])
    }
}

/// Spec §3 "Update Header": present at the start of the external-flash
/// staging region.
#[derive(Clone, Copy, Debug, FromBytes, AsBytes)]
#[repr(C)]
pub struct UpdateHeader {
    pub magic: u32,
    pub firmware_size: u32,
    pub firmware_crc32: u32,
    pub header_offset: u32,
    pub status: u8,
    pub _reserved: [u8; 3],
    pub timestamp: u32,
    pub header_crc32: u32,
}

impl UpdateHeader {
    pub fn new(firmware_size: u32, firmware_crc32: u32, header_offset: u32, timestamp: u32) -> Self {
        let mut header = UpdateHeader {
            magic: UPDATE_MAGIC,
            firmware_size,
            firmware_crc32,
            header_offset,
            status: UPDATE_STATUS_PENDING,
            _reserved: [0; 3],
            timestamp,
            header_crc32: 0,
        };
        header.header_crc32 = crc32(&header.as_bytes()[..24]);
        header
    }

    pub fn is_valid(&self) -> bool {
        self.magic == UPDATE_MAGIC && self.header_crc32 == crc32(&self.as_bytes()[..24])
    }

    pub fn with_status(mut self, status: u8) -> Self {
        self.status = status;
        self.header_crc32 = crc32(&self.as_bytes()[..24]);
        self
    }
}

/// Spec §3 "Boot-shared state": kept in battery-backed memory, read
/// and rewritten once per boot.
#[derive(Clone, Copy, Debug, FromBytes, AsBytes)]
#[repr(C)]
pub struct BootSharedState {
    pub magic: u32,
    pub last_boot_reason: u8,
    pub _reserved: [u8; 3],
    pub app_boot_count: u32,
    pub update_requested: u8,
    pub _reserved2: [u8; 3],
    pub checksum: u32,
}

impl BootSharedState {
    pub fn new(last_boot_reason: u8, app_boot_count: u32, update_requested: bool) -> Self {
        let mut state = BootSharedState {
            magic: SHARED_MAGIC,
            last_boot_reason,
            _reserved: [0; 3],
            app_boot_count,
            update_requested: update_requested as u8,
            _reserved2: [0; 3],
            checksum: 0,
        };
        state.checksum = crc32(&state.as_bytes()[..16]);
        state
    }

    pub fn is_valid(&self) -> bool {
        self.magic == SHARED_MAGIC && self.checksum == crc32(&self.as_bytes()[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn firmware_header_round_trips() {
        let header = FirmwareHeader::new((1, 2, 3, 4), 0x0800_0000, 4096, 0x1234_5678);
        let bytes = header.as_bytes().to_vec();
        let parsed = FirmwareHeader::read_from(&bytes[..]).unwrap();
        assert!(parsed.is_valid());
        assert_eq!(parsed.app_size, 4096);
    }

    #[test]
    fn update_header_status_change_preserves_validity() {
        let header = UpdateHeader::new(4096, 0xDEAD_BEEF, 0, 1000).with_status(UPDATE_STATUS_APPLIED);
        assert!(header.is_valid());
        assert_eq!(header.status, UPDATE_STATUS_APPLIED);
    }

    #[test]
    fn shared_state_detects_corruption() {
        let mut state = BootSharedState::new(0, 1, false);
        assert!(state.is_valid());
        state.app_boot_count = 99;
        assert!(!state.is_valid());
    }
}
