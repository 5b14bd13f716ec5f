// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persistence for the PMU's configuration (spec §4.6): a typed record
//! on internal flash and a free-form JSON blob wear-leveled across two
//! external-flash slots.

mod block;
mod header;
mod record;
mod store;

pub use block::{BlockDevice, BlockError, SimBlockDevice};
pub use header::{crc32, ConfigHeader, CRC32, CURRENT_VERSION, MAGIC_JSON, MAGIC_TYPED};
pub use record::{TypedConfig, ADC_CAL_COUNT};
pub use store::{export_json, import_json, ConfigError, ConfigStore, HEADER_SIZE, JSON_CAP, PROGRAM_GRANULARITY};
