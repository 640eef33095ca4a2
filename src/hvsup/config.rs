// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Program configuration, loadable from a JSON file via `--cfg`.
//!
//! Every section has built-in defaults, so an empty file (or no file at
//! all) yields a working configuration. The register defaults mirror what
//! the boards expect on every connect: checksums on, standby and boot-time
//! behavior off, high voltage dropped on current overload.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use devices::fault::CheckSettings;
use devices::supervisor::DefaultValues;
use hv_protocol::CellRegister;
use hv_protocol::ControllerRegister;
use serde::Deserialize;

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub check: CheckSettings,
    #[serde(default = "default_register_values")]
    pub defaults: DefaultValues,
    pub program: ProgramConfig,
    pub gui: GuiConfig,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            check: CheckSettings::default(),
            defaults: default_register_values(),
            program: ProgramConfig::default(),
            gui: GuiConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct ProgramConfig {
    /// The append-only value log.
    pub data_log_file: PathBuf,
}

impl Default for ProgramConfig {
    fn default() -> ProgramConfig {
        ProgramConfig {
            data_log_file: PathBuf::from("values.csv"),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct GuiConfig {
    pub window_title: String,
}

impl Default for GuiConfig {
    fn default() -> GuiConfig {
        GuiConfig {
            window_title: "Voltage controller".to_string(),
        }
    }
}

fn default_register_values() -> DefaultValues {
    let mut defaults = DefaultValues::default();
    // Always check CRC.
    defaults.controller.insert(ControllerRegister::CheckCrc, 1);
    defaults.cell.insert(CellRegister::CheckCrc, 1);
    // No standby voltage, no delay before standby engages.
    defaults.cell.insert(CellRegister::StandbyVoltage, 0);
    defaults.cell.insert(CellRegister::ProtectionDelay, 0);
    // Do not store the setpoint in EEPROM, do not raise HV on power-up.
    defaults.cell.insert(CellRegister::KeepVoltageSet, 0);
    defaults.cell.insert(CellRegister::EnableOnBoot, 0);
    // Drop high voltage when current overload protection fires.
    defaults.cell.insert(CellRegister::DisableOnOverload, 1);
    defaults
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Config> {
        let file = File::open(path)
            .with_context(|| format!("failed to open config file {}", path.display()))?;
        let config = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }
}
