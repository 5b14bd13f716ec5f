// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The typed internal-flash configuration record (spec §3 "Stored
//! Configuration"): device identity, ADC calibration, protection
//! thresholds, scheduling rates, CAN settings, and running counters.

use zerocopy::{AsBytes, FromBytes};

pub const ADC_CAL_COUNT: usize = 8;

/// Fixed-layout record held at a single internal-flash sector (spec
/// §4.6 "Internal flash holds the typed configuration at a single
/// fixed-address sector").
#[derive(Clone, Copy, Debug, PartialEq, FromBytes, AsBytes)]
#[repr(C)]
pub struct TypedConfig {
    pub device_id: u32,
    pub serial: [u8; 16],
    pub hw_revision: u16,
    pub channel_count: u16,
    /// Per-ADC-channel (gain_milli, offset) calibration pairs.
    pub adc_gain_milli: [i32; ADC_CAL_COUNT],
    pub adc_offset: [i32; ADC_CAL_COUNT],
    pub current_limit_ma: i32,
    pub thermal_shutdown_c: i32,
    pub battery_warn_mv: u16,
    pub battery_critical_mv: u16,
    pub control_rate_hz: u16,
    pub protection_rate_hz: u16,
    pub can_base_id: u32,
    pub can_bitrate_kbps: u32,
    pub power_on_count: u32,
    pub runtime_hours: u32,
    pub fault_count: u32,
    pub last_fault_code: u32,
}

impl Default for TypedConfig {
    fn default() -> Self {
        TypedConfig {
            device_id: 0,
            serial: [0; 16],
            hw_revision: 1,
            channel_count: 0,
            adc_gain_milli: [1000; ADC_CAL_COUNT],
            adc_offset: [0; ADC_CAL_COUNT],
            current_limit_ma: 15_000,
            thermal_shutdown_c: 125,
            battery_warn_mv: 11_000,
            battery_critical_mv: 9_500,
            control_rate_hz: 1_000,
            protection_rate_hz: 1_000,
            can_base_id: 0x100,
            can_bitrate_kbps: 500,
            power_on_count: 0,
            runtime_hours: 0,
            fault_count: 0,
            last_fault_code: 0,
        }
    }
}
