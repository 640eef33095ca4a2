// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Append-only CSV log of cell values.
//!
//! Every cell-updated event becomes one row. Formatting happens on the
//! event loop; the actual file writes run on a dedicated thread so a slow
//! disk cannot stall event handling. The file is line-buffered.

use std::fs::OpenOptions;
use std::io;
use std::io::LineWriter;
use std::io::Write;
use std::path::Path;
use std::sync::mpsc;
use std::thread;

use devices::CellState;
use devices::DeviceAddress;
use log::error;
use log::info;

pub struct DataLogger {
    rows: Option<mpsc::Sender<String>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl DataLogger {
    pub fn new(path: &Path) -> io::Result<DataLogger> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = LineWriter::new(file);
        let (rows, queue) = mpsc::channel::<String>();
        let thread = thread::Builder::new()
            .name("data_logger".to_string())
            .spawn(move || {
                for row in queue {
                    if let Err(e) = writer.write_all(row.as_bytes()) {
                        error!("Failed to write value log: {}", e);
                        return;
                    }
                }
            })?;
        info!("Data logger started");
        Ok(DataLogger {
            rows: Some(rows),
            thread: Some(thread),
        })
    }

    pub fn cell_updated(&self, device: &DeviceAddress, cell_index: usize, state: &CellState) {
        let row = format!(
            "{},{},{},{:.1},{:.1},{:.1},{:.1},{},{}\n",
            device.name,
            cell_index,
            state.enabled.actual(),
            state.voltage_set.actual(),
            state.voltage_measured,
            state.current_measured,
            state.current_limit.actual(),
            state.ramp_down_speed.actual(),
            state.ramp_up_speed.actual(),
        );
        if let Some(rows) = &self.rows {
            let _ = rows.send(row);
        }
    }
}

impl Drop for DataLogger {
    fn drop(&mut self) {
        // Close the queue first so the writer drains and exits.
        self.rows.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use devices::Parameter;
    use hv_protocol::CellCsr;

    use super::*;

    fn sample_state() -> CellState {
        let mut voltage_set = Parameter::new(0.0);
        voltage_set.write_start(50.0);
        voltage_set.write_complete(49.82);
        CellState {
            enabled: Parameter::new(true),
            voltage_set,
            current_limit: Parameter::new(10.0),
            ramp_up_speed: Parameter::new(5),
            ramp_down_speed: Parameter::new(3),
            voltage_measured: 49.75,
            current_measured: 1.26,
            csr: CellCsr::CHANNEL_ON,
            cell_index: 2,
            counter_number: String::new(),
            auto_enable: false,
            voltage_range: (0.0, 3000.0),
            current_limit_range: (0.0, 100.0),
            measured_voltage_range: (0.0, 1000.0),
            measured_current_range: (0.0, 100.0),
        }
    }

    #[test]
    fn rows_use_actual_values_at_one_decimal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("values.csv");
        let device = DeviceAddress {
            name: "psA".to_string(),
            host: "10.0.0.1".to_string(),
            port: 5000,
        };

        let logger = DataLogger::new(&path).unwrap();
        logger.cell_updated(&device, 2, &sample_state());
        drop(logger);

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "psA,2,true,49.8,49.8,1.3,10.0,3,5\n"
        );
    }

    #[test]
    fn log_is_append_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("values.csv");
        fs::write(&path, "old,row\n").unwrap();
        let device = DeviceAddress {
            name: "psA".to_string(),
            host: "10.0.0.1".to_string(),
            port: 5000,
        };

        let logger = DataLogger::new(&path).unwrap();
        logger.cell_updated(&device, 2, &sample_state());
        drop(logger);

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("old,row\n"));
        assert_eq!(contents.lines().count(), 2);
    }
}
