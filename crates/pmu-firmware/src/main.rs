// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-simulatable entry point (spec.md §1: chip bring-up is out of
//! scope). Wires `pmu_core::sim`'s in-memory driver backends into a
//! `Core` and drives it for a bounded number of 1 ms ticks, the
//! closest stand-in this pack can build for the real `#[entry] fn
//! main() -> !` a board would run forever.

use anyhow::Context;
use clap::Parser as ClapParser;
use pmu_config::{ConfigStore, SimBlockDevice};
use pmu_core::drivers::Drivers;
use pmu_core::sim::{SimAnalog, SimCan, SimDigital, SimHBridge, SimPower};
use pmu_core::Core;
use pmu_logger::Logger;

const INTERNAL_SECTOR_LEN: usize = 4096;
const EXTERNAL_SLOT_LEN: usize = 4096;
const LOG_REGION_LEN: usize = 1 << 20;

/// Seeded into the config store before boot so `Core::new` has a real
/// configuration to load (`pmu_core::runtime_config::apply_runtime_config`):
/// one analog input, one power output, and a logic function that turns
/// the output on once the input crosses a threshold. A real board would
/// have this JSON already sitting in external flash from a prior
/// `LOAD_CONFIG` command; there is no such prior session on a fresh
/// simulated store, so this stands in for it.
const DEFAULT_CONFIG_JSON: &str = r#"{
    "channels": [
        {"id": 100, "class": "analog_input", "physical_index": 10, "name": "temp_sensor", "min": 0, "max": 4095},
        {"id": 101, "class": "power_output", "physical_index": 0, "name": "fan_power", "min": 0, "max": 1000}
    ],
    "functions": [
        {"index": 0, "operations": [
            {"op_kind": "gt", "a": {"channel": 100}, "b": {"immediate": 2000.0}, "output": 1}
        ]}
    ],
    "hardware_refreshes": [
        {"channel": 100, "vchan": 0, "scale": 1.0}
    ],
    "output_bindings": [
        {"vchan": 1, "binding": {"kind": "power_on_off", "channel": 101}}
    ]
}"#;

#[derive(ClapParser, Debug)]
#[command(about = "PMU firmware core, running against simulated board drivers")]
struct Args {
    /// Number of 1 ms ticks to run before exiting.
    #[arg(long, default_value_t = 5_000)]
    ticks: u64,

    /// `tracing_subscriber::EnvFilter` directive, e.g. "pmu_core=debug".
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&args.log_level))
        .init();

    let drivers = Drivers {
        analog: SimAnalog::default(),
        digital: SimDigital::default(),
        power: SimPower::default(),
        hbridge: SimHBridge::default(),
        can: SimCan::default(),
    };
    let mut config = ConfigStore::new(
        SimBlockDevice::new(INTERNAL_SECTOR_LEN),
        SimBlockDevice::new(2 * EXTERNAL_SLOT_LEN),
        EXTERNAL_SLOT_LEN,
    );
    config
        .store_json(DEFAULT_CONFIG_JSON.as_bytes())
        .context("failed to seed default runtime configuration")?;
    let logger = Logger::new(SimBlockDevice::new(LOG_REGION_LEN), 0, LOG_REGION_LEN);

    let mut core = Core::new(drivers, config, logger);
    tracing::info!(
        device_id = core.typed_config.device_id,
        power_on_count = core.typed_config.power_on_count,
        "pmu-firmware: booted"
    );

    for now_ms in 0..args.ticks {
        if core.run_due(now_ms) {
            tracing::error!(now_ms, "pmu-firmware: watchdog reset observed, continuing from reinitialized state");
        }
    }

    core.config
        .store_typed(&core.typed_config)
        .context("failed to persist typed configuration on shutdown")?;
    tracing::info!(ticks = args.ticks, "pmu-firmware: run complete");
    Ok(())
}
