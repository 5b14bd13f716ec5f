// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Validates and boots the application image, applies staged updates,
//! and rolls back on failure (spec §4.7).

mod header;

use std::ops::Range;

use pmu_config::{crc32, BlockDevice, BlockError};
use pmu_scheduler::BootReason;
use thiserror::Error;
use zerocopy::{AsBytes, FromBytes};

pub use header::{
    BootSharedState, FirmwareHeader, UpdateHeader, FIRMWARE_MAGIC, SHARED_MAGIC, UPDATE_MAGIC,
    UPDATE_STATUS_APPLIED, UPDATE_STATUS_FAILED, UPDATE_STATUS_PENDING,
};

pub const MAX_BOOT_ATTEMPTS: u32 = 3;
const FIRMWARE_HEADER_SIZE: usize = std::mem::size_of::<FirmwareHeader>();
const UPDATE_HEADER_SIZE: usize = std::mem::size_of::<UpdateHeader>();
const SHARED_STATE_SIZE: usize = std::mem::size_of::<BootSharedState>();
const COPY_CHUNK: usize = 256;

#[derive(Debug, Error)]
pub enum BootError {
    #[error("underlying flash operation failed: {0}")]
    Flash(#[from] BlockError),
}

/// Address ranges a valid vector table's first two words must fall in
/// (spec §4.7 "vector-table sanity"). A real port reads these from the
/// linker script; the sim takes them as configuration.
#[derive(Clone, Debug)]
pub struct VectorTableRanges {
    pub sram: Range<u32>,
    pub flash: Range<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    BootButtonHeld,
    NoValidApplication,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootOutcome {
    JumpToApplication { reason: BootReason, app_boot_count: u32 },
    RemainInBootloader(HaltReason),
}

/// Hook for optional signature verification (spec §4.7: signature
/// verification is left as an interface hook). The default accepts
/// every image; a board that needs authenticated updates overrides
/// `verify`.
pub trait VerifySignature {
    fn verify(&mut self, image: &[u8]) -> bool {
        let _ = image;
        true
    }
}

pub struct NoSignatureCheck;
impl VerifySignature for NoSignatureCheck {}

/// Maps reset-cause inputs to a [`BootReason`] by the spec §4.7 step 2
/// priority: shared-state override, then IWDG reset, then software
/// reset, then power-on.
pub fn determine_boot_reason(shared_override: bool, iwdg_reset: bool, software_reset: bool) -> BootReason {
    if shared_override {
        BootReason::SharedStateOverride
    } else if iwdg_reset {
        BootReason::IwdgReset
    } else if software_reset {
        BootReason::SoftwareReset
    } else {
        BootReason::PowerOn
    }
}

fn boot_reason_to_u8(reason: BootReason) -> u8 {
    match reason {
        BootReason::PowerOn => 0,
        BootReason::SoftwareReset => 1,
        BootReason::IwdgReset => 2,
        BootReason::SharedStateOverride => 3,
    }
}

/// Owns the application/backup flash (one device, two equal regions at
/// offset 0 and `region_size`), the update-staging flash, and the
/// battery-backed shared-state store.
pub struct Bootloader<App, Staging, Shared> {
    app_flash: App,
    staging: Staging,
    shared: Shared,
    region_size: usize,
    ranges: VectorTableRanges,
}

impl<App: BlockDevice, Staging: BlockDevice, Shared: BlockDevice> Bootloader<App, Staging, Shared> {
    pub fn new(app_flash: App, staging: Staging, shared: Shared, region_size: usize, ranges: VectorTableRanges) -> Self {
        Bootloader {
            app_flash,
            staging,
            shared,
            region_size,
            ranges,
        }
    }

    fn backup_offset(&self) -> usize {
        self.region_size
    }

    /// Spec §4.7 step 1: restore shared state, reinitializing with
    /// `reason = POWER_ON` if missing or corrupt.
    pub fn restore_shared_state(&mut self) -> BootSharedState {
        let mut bytes = vec![0u8; SHARED_STATE_SIZE];
        let state = if self.shared.read(0, &mut bytes).is_ok() {
            BootSharedState::read_from(&bytes[..]).filter(|s| s.is_valid())
        } else {
            None
        };
        match state {
            Some(state) => state,
            None => {
                tracing::warn!("bootloader: shared state missing or corrupt, reinitializing");
                let fresh = BootSharedState::new(boot_reason_to_u8(BootReason::PowerOn), 0, false);
                let _ = self.shared.erase(0, SHARED_STATE_SIZE);
                let _ = self.shared.program(0, fresh.as_bytes());
                fresh
            }
        }
    }

    fn persist_shared_state(&mut self, state: &BootSharedState) {
        // Recompute the checksum: callers mutate fields directly on the
        // struct they got back from `restore_shared_state`, so the
        // checksum baked in at construction time is stale here.
        let fresh = BootSharedState::new(state.last_boot_reason, state.app_boot_count, state.update_requested != 0);
        let _ = self.shared.erase(0, SHARED_STATE_SIZE);
        let _ = self.shared.program(0, fresh.as_bytes());
    }

    fn read_firmware_header(&self, offset: usize) -> Option<FirmwareHeader> {
        let mut bytes = vec![0u8; FIRMWARE_HEADER_SIZE];
        self.app_flash.read(offset, &mut bytes).ok()?;
        FirmwareHeader::read_from(&bytes[..])
    }

    /// Spec §4.7 step 5: magic, header CRC, application CRC over the
    /// declared size, and vector-table sanity (initial SP in SRAM,
    /// reset handler in flash).
    fn validate_region(&self, offset: usize) -> bool {
        let Some(header) = self.read_firmware_header(offset) else {
            return false;
        };
        if !header.is_valid() {
            return false;
        }
        let mut body = vec![0u8; header.app_size as usize];
        if self.app_flash.read(offset + FIRMWARE_HEADER_SIZE, &mut body).is_err() {
            return false;
        }
        if crc32(&body) != header.app_crc32 {
            return false;
        }
        if body.len() < 8 {
            return false;
        }
        let initial_sp = u32::from_le_bytes(body[0..4].try_into().unwrap());
        let reset_handler = u32::from_le_bytes(body[4..8].try_into().unwrap());
        self.ranges.sram.contains(&initial_sp) && self.ranges.flash.contains(&reset_handler)
    }

    fn copy_region(&mut self, src_offset: usize, dst_offset: usize, len: usize) -> Result<(), BootError> {
        let mut remaining = len;
        let mut buf = vec![0u8; COPY_CHUNK];
        let mut off = 0usize;
        while remaining > 0 {
            let chunk = remaining.min(COPY_CHUNK);
            self.app_flash.read(src_offset + off, &mut buf[..chunk])?;
            self.app_flash.program(dst_offset + off, &buf[..chunk])?;
            off += chunk;
            remaining -= chunk;
        }
        Ok(())
    }

    /// Spec §4.7 "Rollback": validate the backup; if valid, erase the
    /// application region and restore the backup into it.
    fn rollback(&mut self) -> bool {
        if !self.validate_region(self.backup_offset()) {
            tracing::error!("bootloader: rollback requested but backup is invalid");
            return false;
        }
        let _ = self.app_flash.erase(0, self.region_size);
        if self.copy_region(self.backup_offset(), 0, self.region_size).is_err() {
            return false;
        }
        let valid = self.validate_region(0);
        tracing::warn!(valid, "bootloader: rollback applied");
        valid
    }

    /// Spec §4.7 "Apply update": back up the current application, copy
    /// the staged image into the application region, validate, and
    /// mark the staging header APPLIED (or FAILED on validation
    /// failure).
    fn apply_update(&mut self, signer: &mut dyn VerifySignature) -> Result<bool, BootError> {
        let mut header_bytes = vec![0u8; UPDATE_HEADER_SIZE];
        self.staging.read(0, &mut header_bytes)?;
        let Some(update_header) = UpdateHeader::read_from(&header_bytes[..]) else {
            return Ok(false);
        };
        if !update_header.is_valid() || update_header.status != UPDATE_STATUS_PENDING {
            return Ok(false);
        }

        let mut image = vec![0u8; update_header.firmware_size as usize];
        self.staging.read(UPDATE_HEADER_SIZE, &mut image)?;
        if crc32(&image) != update_header.firmware_crc32 || !signer.verify(&image) {
            self.mark_update_status(&update_header, UPDATE_STATUS_FAILED)?;
            return Ok(false);
        }

        // Back up the current application before overwriting it.
        let _ = self.app_flash.erase(self.backup_offset(), self.region_size);
        self.copy_region(0, self.backup_offset(), self.region_size)?;

        self.app_flash.erase(0, self.region_size)?;
        let mut off = 0usize;
        while off < image.len() {
            let end = (off + COPY_CHUNK).min(image.len());
            self.app_flash.program(off, &image[off..end])?;
            off = end;
        }

        let ok = self.validate_region(0);
        self.mark_update_status(&update_header, if ok { UPDATE_STATUS_APPLIED } else { UPDATE_STATUS_FAILED })?;
        Ok(ok)
    }

    fn mark_update_status(&mut self, header: &UpdateHeader, status: u8) -> Result<(), BootError> {
        let updated = (*header).with_status(status);
        self.staging.erase(0, UPDATE_HEADER_SIZE)?;
        self.staging.program(0, updated.as_bytes())?;
        Ok(())
    }

    fn update_is_pending(&self) -> bool {
        let mut header_bytes = vec![0u8; UPDATE_HEADER_SIZE];
        if self.staging.read(0, &mut header_bytes).is_err() {
            return false;
        }
        UpdateHeader::read_from(&header_bytes[..])
            .map(|h| h.is_valid() && h.status == UPDATE_STATUS_PENDING)
            .unwrap_or(false)
    }

    /// Runs the full spec §4.7 boot sequence.
    pub fn run(
        &mut self,
        boot_button: bool,
        shared_override: bool,
        iwdg_reset: bool,
        software_reset: bool,
        signer: &mut dyn VerifySignature,
    ) -> Result<BootOutcome, BootError> {
        let mut shared = self.restore_shared_state();
        let reason = determine_boot_reason(shared_override, iwdg_reset, software_reset);
        shared.last_boot_reason = boot_reason_to_u8(reason);

        if boot_button {
            self.persist_shared_state(&shared);
            return Ok(BootOutcome::RemainInBootloader(HaltReason::BootButtonHeld));
        }

        if shared.update_requested != 0 || self.update_is_pending() {
            match self.apply_update(signer) {
                Ok(true) => {
                    shared.update_requested = 0;
                }
                _ => {
                    shared.update_requested = 0;
                    self.rollback();
                }
            }
        }

        if !self.validate_region(0) && !self.rollback() {
            self.persist_shared_state(&shared);
            return Ok(BootOutcome::RemainInBootloader(HaltReason::NoValidApplication));
        }

        if shared.app_boot_count >= MAX_BOOT_ATTEMPTS {
            tracing::warn!(count = shared.app_boot_count, "bootloader: boot-attempt cap reached, rolling back");
            if self.rollback() {
                shared.app_boot_count = 0;
            }
        }

        shared.app_boot_count += 1;
        self.persist_shared_state(&shared);
        Ok(BootOutcome::JumpToApplication {
            reason,
            app_boot_count: shared.app_boot_count,
        })
    }
}
