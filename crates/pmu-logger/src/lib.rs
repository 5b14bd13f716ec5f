// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Captures session samples to external block storage behind a
//! session-header index (spec §4.8): a fixed-layout header identifies
//! the session, and a fixed-layout sample is appended each tick through
//! a small RAM staging buffer so flash is only touched page at a time.

use pmu_config::{crc32, BlockDevice, BlockError};
use thiserror::Error;
use zerocopy::{AsBytes, FromBytes};

pub const SESSION_MAGIC: u32 = 0x504D_554C; // "PMUL"
pub const MAX_LOG_CHANNELS: usize = 16;
/// Fixed staging-buffer flush threshold; a real board sizes this to its
/// flash page (spec §4.8 "page-sized writes").
pub const STAGING_PAGE_SIZE: usize = 256;

pub const HEADER_SIZE: usize = std::mem::size_of::<SessionHeader>();
pub const SAMPLE_SIZE: usize = std::mem::size_of::<LogSample>();

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("a session is already active")]
    AlreadyStarted,
    #[error("no session is active")]
    NotStarted,
    #[error("channel map exceeds the {MAX_LOG_CHANNELS}-channel capacity")]
    TooManyChannels,
    #[error("logging region is full")]
    RegionFull,
    #[error("underlying flash operation failed: {0}")]
    Flash(#[from] BlockError),
}

/// Spec §4.8 "session header": magic, session id, start time, sample
/// rate, channel count, header size, placeholder data size, channel
/// map.
#[derive(Clone, Copy, Debug, FromBytes, AsBytes)]
#[repr(C)]
pub struct SessionHeader {
    pub magic: u32,
    pub session_id: u32,
    pub start_time_ms: u32,
    pub sample_rate_hz: u16,
    pub channel_count: u16,
    pub header_size: u16,
    pub sample_size: u16,
    pub channel_map: [u16; MAX_LOG_CHANNELS],
    pub header_crc32: u32,
}

impl SessionHeader {
    fn new(session_id: u32, start_time_ms: u32, sample_rate_hz: u16, channel_ids: &[u16]) -> Self {
        let mut channel_map = [0u16; MAX_LOG_CHANNELS];
        channel_map[..channel_ids.len()].copy_from_slice(channel_ids);
        let mut header = SessionHeader {
            magic: SESSION_MAGIC,
            session_id,
            start_time_ms,
            sample_rate_hz,
            channel_count: channel_ids.len() as u16,
            header_size: HEADER_SIZE as u16,
            sample_size: SAMPLE_SIZE as u16,
            channel_map,
            header_crc32: 0,
        };
        let crc_len = HEADER_SIZE - 4;
        header.header_crc32 = crc32(&header.as_bytes()[..crc_len]);
        header
    }

    pub fn is_valid(&self) -> bool {
        let crc_len = HEADER_SIZE - 4;
        self.magic == SESSION_MAGIC && self.header_crc32 == crc32(&self.as_bytes()[..crc_len])
    }
}

/// Spec §4.8 "fixed-layout sample": `timestamp_u32 + per-channel
/// values`, padded to [`MAX_LOG_CHANNELS`] regardless of the active
/// session's channel count so every record is the same size on flash.
#[derive(Clone, Copy, Debug, FromBytes, AsBytes)]
#[repr(C)]
pub struct LogSample {
    pub timestamp_ms: u32,
    pub values: [i32; MAX_LOG_CHANNELS],
}

impl LogSample {
    pub fn new(timestamp_ms: u32, values: &[i32]) -> Self {
        let mut padded = [0i32; MAX_LOG_CHANNELS];
        padded[..values.len()].copy_from_slice(values);
        LogSample {
            timestamp_ms,
            values: padded,
        }
    }
}

/// Appends session samples to a contiguous staging region of `device`.
pub struct Logger<D> {
    device: D,
    region_offset: usize,
    region_len: usize,
    write_cursor: usize,
    staging: Vec<u8>,
    active: bool,
}

impl<D: BlockDevice> Logger<D> {
    pub fn new(device: D, region_offset: usize, region_len: usize) -> Self {
        Logger {
            device,
            region_offset,
            region_len,
            write_cursor: 0,
            staging: Vec::with_capacity(STAGING_PAGE_SIZE),
            active: false,
        }
    }

    /// Spec §4.8 "On start": erase the region and write the session
    /// header.
    pub fn start_session(
        &mut self,
        session_id: u32,
        start_time_ms: u32,
        sample_rate_hz: u16,
        channel_ids: &[u16],
    ) -> Result<(), LoggerError> {
        if self.active {
            return Err(LoggerError::AlreadyStarted);
        }
        if channel_ids.len() > MAX_LOG_CHANNELS {
            return Err(LoggerError::TooManyChannels);
        }
        self.device.erase(self.region_offset, self.region_len)?;
        let header = SessionHeader::new(session_id, start_time_ms, sample_rate_hz, channel_ids);
        self.device.program(self.region_offset, header.as_bytes())?;
        self.write_cursor = HEADER_SIZE;
        self.staging.clear();
        self.active = true;
        tracing::info!(session_id, channel_count = channel_ids.len(), "logger: session started");
        Ok(())
    }

    /// Spec §4.8 "Each tick a fixed-layout sample... is appended through
    /// a small RAM staging buffer (page-sized writes)".
    pub fn append_sample(&mut self, timestamp_ms: u32, values: &[i32]) -> Result<(), LoggerError> {
        if !self.active {
            return Err(LoggerError::NotStarted);
        }
        let sample = LogSample::new(timestamp_ms, values);
        self.staging.extend_from_slice(sample.as_bytes());
        if self.staging.len() >= STAGING_PAGE_SIZE {
            self.flush_page()?;
        }
        Ok(())
    }

    fn flush_page(&mut self) -> Result<(), LoggerError> {
        if self.staging.is_empty() {
            return Ok(());
        }
        if self.write_cursor + self.staging.len() > self.region_len {
            return Err(LoggerError::RegionFull);
        }
        self.device
            .program(self.region_offset + self.write_cursor, &self.staging)?;
        self.write_cursor += self.staging.len();
        self.staging.clear();
        Ok(())
    }

    /// Spec §4.8 "On stop: flush".
    pub fn stop(&mut self) -> Result<(), LoggerError> {
        if !self.active {
            return Err(LoggerError::NotStarted);
        }
        self.flush_page()?;
        self.active = false;
        tracing::info!("logger: session stopped");
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Raw read back out of the logging region, for `DOWNLOAD_LOG` (spec
    /// §4.5): the protocol layer addresses by byte offset/length within
    /// the active session's region, not by parsed sample.
    pub fn read_bytes(&self, offset: usize, buf: &mut [u8]) -> Result<(), LoggerError> {
        self.device.read(self.region_offset + offset, buf)?;
        Ok(())
    }

    /// Erases the whole logging region (spec §4.5 `ERASE_LOGS`).
    pub fn erase_all(&mut self) -> Result<(), LoggerError> {
        self.device.erase(self.region_offset, self.region_len)?;
        self.write_cursor = 0;
        self.staging.clear();
        self.active = false;
        Ok(())
    }

    pub fn samples_written(&self) -> usize {
        (self.write_cursor.saturating_sub(HEADER_SIZE)) / SAMPLE_SIZE
    }

    /// Spec §4.8 "Sessions are recovered by linear scan for header
    /// magic": walk `device` at `stride` byte steps looking for a valid
    /// header.
    pub fn recover_sessions(device: &D, len: usize, stride: usize) -> Vec<(usize, SessionHeader)> {
        let mut found = Vec::new();
        let mut offset = 0;
        let mut bytes = [0u8; HEADER_SIZE];
        while offset + HEADER_SIZE <= len {
            if device.read(offset, &mut bytes).is_ok() {
                if let Some(header) = SessionHeader::read_from(&bytes[..]) {
                    if header.is_valid() {
                        found.push((offset, header));
                    }
                }
            }
            offset += stride;
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmu_config::SimBlockDevice;

    const REGION_LEN: usize = 4096;

    fn logger() -> Logger<SimBlockDevice> {
        Logger::new(SimBlockDevice::new(REGION_LEN), 0, REGION_LEN)
    }

    #[test]
    fn start_session_writes_valid_header() {
        let mut log = logger();
        log.start_session(1, 1000, 100, &[1, 2, 3]).unwrap();
        let sessions = Logger::recover_sessions(&log.device, REGION_LEN, HEADER_SIZE);
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].1.session_id, 1);
        assert_eq!(sessions[0].1.channel_count, 3);
    }

    #[test]
    fn append_without_start_is_rejected() {
        let mut log = logger();
        assert!(matches!(log.append_sample(0, &[1]), Err(LoggerError::NotStarted)));
    }

    #[test]
    fn samples_flush_once_staging_page_fills() {
        let mut log = logger();
        log.start_session(1, 0, 100, &[1, 2]).unwrap();
        let samples_per_page = STAGING_PAGE_SIZE / SAMPLE_SIZE + 1;
        for i in 0..samples_per_page {
            log.append_sample(i as u32, &[10, 20]).unwrap();
        }
        assert!(log.write_cursor > HEADER_SIZE);
        log.stop().unwrap();
        assert_eq!(log.samples_written(), samples_per_page);
    }

    #[test]
    fn stop_flushes_partial_staging_buffer() {
        let mut log = logger();
        log.start_session(1, 0, 100, &[1]).unwrap();
        log.append_sample(5, &[42]).unwrap();
        assert_eq!(log.samples_written(), 0); // still staged, not yet flushed
        log.stop().unwrap();
        assert_eq!(log.samples_written(), 1);
    }

    #[test]
    fn second_session_overwrites_region_with_new_header() {
        let mut log = logger();
        log.start_session(1, 0, 100, &[1]).unwrap();
        log.append_sample(0, &[7]).unwrap();
        log.stop().unwrap();

        log.start_session(2, 500, 200, &[1, 2]).unwrap();
        let sessions = Logger::recover_sessions(&log.device, REGION_LEN, HEADER_SIZE);
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].1.session_id, 2);
    }

    #[test]
    fn starting_twice_without_stopping_is_rejected() {
        let mut log = logger();
        log.start_session(1, 0, 100, &[1]).unwrap();
        assert!(matches!(
            log.start_session(2, 0, 100, &[1]),
            Err(LoggerError::AlreadyStarted)
        ));
    }

    #[test]
    fn read_bytes_returns_header_magic() {
        let mut log = logger();
        log.start_session(1, 0, 100, &[1]).unwrap();
        let mut buf = [0u8; 4];
        log.read_bytes(0, &mut buf).unwrap();
        assert_eq!(u32::from_ne_bytes(buf), SESSION_MAGIC);
    }

    #[test]
    fn erase_all_clears_session_and_recovery() {
        let mut log = logger();
        log.start_session(1, 0, 100, &[1]).unwrap();
        log.erase_all().unwrap();
        assert!(!log.is_active());
        assert!(Logger::recover_sessions(&log.device, REGION_LEN, HEADER_SIZE).is_empty());
    }

    #[test]
    fn too_many_channels_is_rejected() {
        let mut log = logger();
        let ids: Vec<u16> = (0..(MAX_LOG_CHANNELS as u16 + 1)).collect();
        assert!(matches!(
            log.start_session(1, 0, 100, &ids),
            Err(LoggerError::TooManyChannels)
        ));
    }
}
