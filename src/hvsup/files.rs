// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Loaders for the CSV files the program consumes.
//!
//! Both formats are plain comma-separated text with a fixed header and no
//! quoting; whitespace after a delimiter is ignored. Line numbers in errors
//! are 1-based and count the header.

use std::fs;
use std::io;
use std::path::Path;

use devices::profile::Profile;
use devices::CellSettings;
use devices::DeviceAddress;
use log::error;
use log::warn;
use remain::sorted;
use thiserror::Error;

/// A malformed row or header, with its position in the file.
#[derive(Error, Debug, PartialEq)]
#[error("line {line}: {reason}")]
pub struct FormatError {
    pub line: usize,
    pub reason: String,
}

#[sorted]
#[derive(Error, Debug)]
pub enum LoadError {
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

fn split_row(line: &str) -> Vec<&str> {
    line.split(',').map(str::trim_start).collect()
}

/// Reads the device list. A file with an unexpected header is answered
/// with a warning and an empty list; a malformed row aborts the load.
pub fn read_device_list(path: &Path) -> Result<Vec<DeviceAddress>, LoadError> {
    const EXPECTED: [&str; 3] = ["name", "address", "port"];

    let contents = fs::read_to_string(path)?;
    let mut lines = contents.lines().enumerate();
    let header = lines.next().map(|(_, line)| split_row(line));
    if header.as_deref() != Some(EXPECTED.as_slice()) {
        warn!(
            "Wrong csv file header. Expected: {:?}, Actual: {:?}",
            EXPECTED, header
        );
        return Ok(Vec::new());
    }

    let mut result = Vec::new();
    for (index, line) in lines {
        let line_no = index + 1;
        let row = split_row(line);
        let (name, host, port) = match row.as_slice() {
            [name, host, port] => (*name, *host, *port),
            _ => {
                error!("Wrong row format at line {}", line_no);
                return Err(FormatError {
                    line: line_no,
                    reason: format!("expected 3 fields, found {}", row.len()),
                }
                .into());
            }
        };
        let port = port.parse::<u16>().map_err(|e| {
            error!("Wrong row format at line {}", line_no);
            FormatError {
                line: line_no,
                reason: format!("bad port {:?}: {}", port, e),
            }
        })?;
        result.push(DeviceAddress {
            name: name.to_string(),
            host: host.to_string(),
            port,
        });
    }
    Ok(result)
}

/// Reads a profile file. Cells parsed from a profile start out disabled;
/// `auto_enable` marks the ones the operator may enable in bulk later.
pub fn read_profile(path: &Path) -> Result<Profile, LoadError> {
    const EXPECTED: [&str; 7] = [
        "device",
        "cell_index",
        "auto_enable",
        "voltage",
        "current_limit",
        "ramp_up",
        "ramp_down",
    ];

    let contents = fs::read_to_string(path)?;
    let mut lines = contents.lines().enumerate();
    let header = lines.next().map(|(_, line)| split_row(line));
    if header.as_deref() != Some(EXPECTED.as_slice()) {
        return Err(FormatError {
            line: 1,
            reason: format!(
                "wrong csv file header, expected: {:?}, actual: {:?}",
                EXPECTED, header
            ),
        }
        .into());
    }

    let mut profile = Profile::new(path.to_path_buf());
    for (index, line) in lines {
        let line_no = index + 1;
        let bad_row = |reason: String| FormatError {
            line: line_no,
            reason,
        };
        let row = split_row(line);
        let fields: [&str; 7] = match row.as_slice().try_into() {
            Ok(fields) => fields,
            Err(_) => {
                return Err(bad_row(format!("expected 7 fields, found {}", row.len())).into())
            }
        };
        let [device, cell_index, auto_enable, voltage, current_limit, ramp_up, ramp_down] = fields;
        let settings = CellSettings {
            enabled: false,
            voltage_set: voltage
                .parse()
                .map_err(|e| bad_row(format!("bad voltage {:?}: {}", voltage, e)))?,
            current_limit: current_limit
                .parse()
                .map_err(|e| bad_row(format!("bad current limit {:?}: {}", current_limit, e)))?,
            ramp_up_speed: ramp_up
                .parse()
                .map_err(|e| bad_row(format!("bad ramp up speed {:?}: {}", ramp_up, e)))?,
            ramp_down_speed: ramp_down
                .parse()
                .map_err(|e| bad_row(format!("bad ramp down speed {:?}: {}", ramp_down, e)))?,
            counter_number: String::new(),
            auto_enable: auto_enable.eq_ignore_ascii_case("true"),
        };
        let cell_index = cell_index
            .parse::<usize>()
            .map_err(|e| bad_row(format!("bad cell index {:?}: {}", cell_index, e)))?;
        profile.insert(device, cell_index, settings);
    }
    Ok(profile)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    fn write_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn device_list_roundtrip() {
        let file = write_file("name,address,port\nA, 10.0.0.1, 5000\nB,10.0.0.2,5001\n");
        let devices = read_device_list(file.path()).unwrap();
        assert_eq!(
            devices,
            vec![
                DeviceAddress {
                    name: "A".to_string(),
                    host: "10.0.0.1".to_string(),
                    port: 5000,
                },
                DeviceAddress {
                    name: "B".to_string(),
                    host: "10.0.0.2".to_string(),
                    port: 5001,
                },
            ]
        );
    }

    #[test]
    fn device_list_bad_header_yields_empty_list() {
        let file = write_file("nombre,address,port\nA,10.0.0.1,5000\n");
        assert_eq!(read_device_list(file.path()).unwrap(), Vec::new());
    }

    #[test]
    fn device_list_bad_row_aborts() {
        let file = write_file("name,address,port\nA,10.0.0.1,5000\nB,10.0.0.2\n");
        match read_device_list(file.path()) {
            Err(LoadError::Format(e)) => {
                assert_eq!(e.line, 3);
                assert!(e.reason.contains("3 fields"), "reason = {}", e.reason);
            }
            other => panic!("expected a format error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn device_list_bad_port_aborts() {
        let file = write_file("name,address,port\nA,10.0.0.1,50000000\n");
        match read_device_list(file.path()) {
            Err(LoadError::Format(e)) => assert_eq!(e.line, 2),
            other => panic!("expected a format error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn profile_roundtrip() {
        let file = write_file(
            "device,cell_index,auto_enable,voltage,current_limit,ramp_up,ramp_down\n\
             A, 1, true, 50, 10, 1, 1\n\
             A, 3, FALSE, 120.5, 20, 2, 3\n\
             B, 1, True, 60, 10, 1, 1\n",
        );
        let profile = read_profile(file.path()).unwrap();
        let a = profile.device("A");
        assert_eq!(a.cell_settings.len(), 2);
        let cell1 = &a.cell_settings[&1];
        assert!(!cell1.enabled);
        assert!(cell1.auto_enable);
        assert_eq!(cell1.voltage_set, 50.0);
        assert_eq!(cell1.ramp_down_speed, 1);
        let cell3 = &a.cell_settings[&3];
        assert!(!cell3.auto_enable);
        assert_eq!(cell3.voltage_set, 120.5);
        assert_eq!(profile.device("B").cell_settings.len(), 1);
        // Absent devices resolve to an empty profile.
        assert!(profile.device("C").cell_settings.is_empty());
    }

    #[test]
    fn profile_bad_header_is_a_format_error() {
        let file = write_file("device,cell,auto_enable,voltage,current_limit,ramp_up,ramp_down\n");
        match read_profile(file.path()) {
            Err(LoadError::Format(e)) => assert_eq!(e.line, 1),
            other => panic!("expected a format error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn profile_bad_row_reports_line_and_reason() {
        let file = write_file(
            "device,cell_index,auto_enable,voltage,current_limit,ramp_up,ramp_down\n\
             A,1,true,50,10,1,1\n\
             A,2,true,fifty,10,1,1\n",
        );
        match read_profile(file.path()) {
            Err(LoadError::Format(e)) => {
                assert_eq!(e.line, 3);
                assert!(e.reason.contains("voltage"), "reason = {}", e.reason);
            }
            other => panic!("expected a format error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn missing_file_is_an_io_error() {
        assert!(matches!(
            read_device_list(Path::new("/nonexistent/devices.csv")),
            Err(LoadError::Io(_))
        ));
    }
}
