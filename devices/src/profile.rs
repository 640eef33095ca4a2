// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Saved cell settings, keyed by device name and cell index.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use crate::CellSettings;

/// The settings a profile assigns to one device's cells. Cells absent from
/// the map are disabled when the profile is applied.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeviceProfile {
    /// Keyed by cell index, numbering from one. Ordered so apply jobs run
    /// in cell order.
    pub cell_settings: BTreeMap<usize, CellSettings>,
}

/// A parsed profile file.
#[derive(Debug)]
pub struct Profile {
    source: PathBuf,
    devices: HashMap<String, DeviceProfile>,
}

impl Profile {
    pub fn new(source: PathBuf) -> Profile {
        Profile {
            source,
            devices: HashMap::new(),
        }
    }

    /// The file this profile was loaded from, for display.
    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn insert(&mut self, device: &str, cell_index: usize, settings: CellSettings) {
        self.devices
            .entry(device.to_string())
            .or_default()
            .cell_settings
            .insert(cell_index, settings);
    }

    /// The profile for one device. A device the file does not mention gets
    /// an empty profile, which disables every cell on apply.
    pub fn device(&self, name: &str) -> DeviceProfile {
        self.devices.get(name).cloned().unwrap_or_default()
    }

    pub fn device_names(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(voltage: f64) -> CellSettings {
        CellSettings {
            enabled: false,
            voltage_set: voltage,
            current_limit: 10.0,
            ramp_up_speed: 1,
            ramp_down_speed: 1,
            counter_number: String::new(),
            auto_enable: true,
        }
    }

    #[test]
    fn unknown_device_yields_empty_profile() {
        let profile = Profile::new(PathBuf::from("profile.csv"));
        assert_eq!(profile.device("nope"), DeviceProfile::default());
    }

    #[test]
    fn settings_are_kept_in_cell_order() {
        let mut profile = Profile::new(PathBuf::from("profile.csv"));
        profile.insert("psA", 9, settings(90.0));
        profile.insert("psA", 2, settings(20.0));
        let device = profile.device("psA");
        let indexes: Vec<usize> = device.cell_settings.keys().copied().collect();
        assert_eq!(indexes, vec![2, 9]);
        assert_eq!(device.cell_settings[&9].voltage_set, 90.0);
    }
}
