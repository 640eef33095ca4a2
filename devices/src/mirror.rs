// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! In-memory mirror of one board's state.
//!
//! The mirror is created once, during the initial full read at connect
//! time, and mutated in place afterwards. It is owned exclusively by the
//! supervisor's worker thread; everything the front end sees is a clone
//! carried by an event.

use hv_protocol::CellCsr;
use hv_protocol::ControllerStatus;
use hv_protocol::TemperatureSensor;

use crate::Device;
use crate::DeviceAddress;
use crate::DeviceError;
use crate::Parameter;

/// State of one output cell.
#[derive(Clone, Debug, PartialEq)]
pub struct CellState {
    // Writable parameters with their desired values.
    /// Whether the output voltage is on.
    pub enabled: Parameter<bool>,
    /// Output voltage setpoint in volts.
    pub voltage_set: Parameter<f64>,
    /// Current limit in microamperes.
    pub current_limit: Parameter<f64>,
    /// Ramp-up speed in V/s.
    pub ramp_up_speed: Parameter<u16>,
    /// Ramp-down speed in V/s.
    pub ramp_down_speed: Parameter<u16>,

    // Readonly sensed values.
    /// Measured output voltage in volts.
    pub voltage_measured: f64,
    /// Measured current in microamperes.
    pub current_measured: f64,
    /// Control/status word.
    pub csr: CellCsr,

    // Operator annotations, not present on the device.
    /// Cell index, numbering from one.
    pub cell_index: usize,
    pub counter_number: String,
    /// Whether the cell may be enabled automatically.
    pub auto_enable: bool,

    // Session constants.
    pub voltage_range: (f64, f64),
    pub current_limit_range: (f64, f64),
    pub measured_voltage_range: (f64, f64),
    pub measured_current_range: (f64, f64),
}

/// One poll's worth of a cell's mutable values, without desired values.
#[derive(Clone, Debug, PartialEq)]
pub struct CellUpdates {
    pub enabled: bool,
    pub voltage_set: f64,
    pub current_limit: f64,
    pub ramp_up_speed: u16,
    pub ramp_down_speed: u16,
    pub voltage_measured: f64,
    pub current_measured: f64,
    pub csr: CellCsr,
}

/// Values of the writable cell parameters, as requested or as echoed.
#[derive(Clone, Debug, PartialEq)]
pub struct CellSettings {
    pub enabled: bool,
    pub voltage_set: f64,
    pub current_limit: f64,
    pub ramp_up_speed: u16,
    pub ramp_down_speed: u16,
    pub counter_number: String,
    pub auto_enable: bool,
}

/// The per-cell session constants the front end validates against.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CellConstants {
    pub voltage_range: (f64, f64),
    pub current_limit_range: (f64, f64),
}

/// State of the controller bank.
#[derive(Clone, Debug, PartialEq)]
pub struct ControllerState {
    pub base_voltage_enabled: Parameter<bool>,
    /// Fan switch-off temperature, degrees C.
    pub fan_off_temp: Parameter<u16>,
    /// Fan switch-on temperature, degrees C.
    pub fan_on_temp: Parameter<u16>,
    /// Cell shutdown temperature, degrees C.
    pub shutdown_temp: Parameter<u16>,
    pub temp_sensor: Parameter<TemperatureSensor>,

    pub status: ControllerStatus,
    pub processor_temp: u16,
    pub board_temp: u16,
    pub power_supply_temp: u16,
    /// Low-voltage supply readout in volts.
    pub low_voltage: f64,
    /// Base voltage readout in volts.
    pub base_voltage: f64,
}

/// One poll's worth of the controller's mutable values.
#[derive(Clone, Debug, PartialEq)]
pub struct ControllerUpdates {
    pub base_voltage_enabled: bool,
    pub fan_off_temp: u16,
    pub fan_on_temp: u16,
    pub shutdown_temp: u16,
    pub temp_sensor: TemperatureSensor,
    pub status: ControllerStatus,
    pub processor_temp: u16,
    pub board_temp: u16,
    pub power_supply_temp: u16,
    pub low_voltage: f64,
    pub base_voltage: f64,
}

/// Mirror of a whole board.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceState {
    pub address: DeviceAddress,
    pub controller: ControllerState,
    /// Cell 1 is at index 0.
    pub cells: Vec<CellState>,
}

impl CellState {
    pub fn constants(&self) -> CellConstants {
        CellConstants {
            voltage_range: self.voltage_range,
            current_limit_range: self.current_limit_range,
        }
    }

    /// Applies one poll's values; see [`Parameter::poll_update`] for how
    /// desired values are reconciled.
    pub fn apply_updates(&mut self, updates: &CellUpdates) {
        self.enabled.poll_update(updates.enabled);
        self.voltage_set.poll_update(updates.voltage_set);
        self.current_limit.poll_update(updates.current_limit);
        self.ramp_up_speed.poll_update(updates.ramp_up_speed);
        self.ramp_down_speed.poll_update(updates.ramp_down_speed);
        self.voltage_measured = updates.voltage_measured;
        self.current_measured = updates.current_measured;
        self.csr = updates.csr;
    }

    /// Records operator intent for a compound write of all five parameters.
    pub fn start_settings(&mut self, settings: &CellSettings) {
        self.enabled.write_start(settings.enabled);
        self.voltage_set.write_start(settings.voltage_set);
        self.current_limit.write_start(settings.current_limit);
        self.ramp_up_speed.write_start(settings.ramp_up_speed);
        self.ramp_down_speed.write_start(settings.ramp_down_speed);
        self.counter_number = settings.counter_number.clone();
        self.auto_enable = settings.auto_enable;
    }

    /// Applies the echoes of a completed compound write.
    pub fn complete_settings(&mut self, settings: &CellSettings) {
        self.enabled.write_complete(settings.enabled);
        self.voltage_set.write_complete(settings.voltage_set);
        self.current_limit.write_complete(settings.current_limit);
        self.ramp_up_speed.write_complete(settings.ramp_up_speed);
        self.ramp_down_speed.write_complete(settings.ramp_down_speed);
        self.counter_number = settings.counter_number.clone();
        self.auto_enable = settings.auto_enable;
    }
}

impl ControllerState {
    pub fn apply_updates(&mut self, updates: &ControllerUpdates) {
        self.base_voltage_enabled.poll_update(updates.base_voltage_enabled);
        self.fan_off_temp.poll_update(updates.fan_off_temp);
        self.fan_on_temp.poll_update(updates.fan_on_temp);
        self.shutdown_temp.poll_update(updates.shutdown_temp);
        self.temp_sensor.poll_update(updates.temp_sensor);
        self.status = updates.status;
        self.processor_temp = updates.processor_temp;
        self.board_temp = updates.board_temp;
        self.power_supply_temp = updates.power_supply_temp;
        self.low_voltage = updates.low_voltage;
        self.base_voltage = updates.base_voltage;
    }
}

/// Reads the full state of one cell, values and session constants both.
pub fn read_cell_state(device: &mut Device, cell: usize) -> Result<CellState, DeviceError> {
    let csr = device.cell_csr(cell)?;
    Ok(CellState {
        enabled: Parameter::new(csr.contains(CellCsr::CHANNEL_ON)),
        voltage_set: Parameter::new(device.cell_output_voltage(cell)?),
        current_limit: Parameter::new(device.cell_current_limit(cell)?),
        ramp_up_speed: Parameter::new(device.cell_ramp_up_speed(cell)?),
        ramp_down_speed: Parameter::new(device.cell_ramp_down_speed(cell)?),
        voltage_measured: device.cell_measured_voltage(cell)?,
        current_measured: device.cell_measured_current(cell)?,
        csr,
        cell_index: cell,
        counter_number: String::new(),
        auto_enable: false,
        voltage_range: device.cell_voltage_range(cell)?,
        current_limit_range: device.cell_current_limit_range(cell)?,
        measured_voltage_range: device.cell_measured_voltage_range(cell)?,
        measured_current_range: device.cell_measured_current_range(cell)?,
    })
}

/// Reads the mutable values of one cell. Session constants are served from
/// the session cache and cause no wire traffic here.
pub fn read_cell_updates(device: &mut Device, cell: usize) -> Result<CellUpdates, DeviceError> {
    let csr = device.cell_csr(cell)?;
    Ok(CellUpdates {
        enabled: csr.contains(CellCsr::CHANNEL_ON),
        voltage_set: device.cell_output_voltage(cell)?,
        current_limit: device.cell_current_limit(cell)?,
        ramp_up_speed: device.cell_ramp_up_speed(cell)?,
        ramp_down_speed: device.cell_ramp_down_speed(cell)?,
        voltage_measured: device.cell_measured_voltage(cell)?,
        current_measured: device.cell_measured_current(cell)?,
        csr,
    })
}

/// Writes all five cell parameters in order and collects each echo.
pub fn write_cell_settings(
    device: &mut Device,
    cell: usize,
    settings: &CellSettings,
) -> Result<CellSettings, DeviceError> {
    Ok(CellSettings {
        enabled: device.set_cell_enabled(cell, settings.enabled)?,
        voltage_set: device.set_cell_output_voltage(cell, settings.voltage_set)?,
        current_limit: device.set_cell_current_limit(cell, settings.current_limit)?,
        ramp_up_speed: device.set_cell_ramp_up_speed(cell, settings.ramp_up_speed)?,
        ramp_down_speed: device.set_cell_ramp_down_speed(cell, settings.ramp_down_speed)?,
        counter_number: settings.counter_number.clone(),
        auto_enable: settings.auto_enable,
    })
}

pub fn read_controller_state(device: &mut Device) -> Result<ControllerState, DeviceError> {
    Ok(ControllerState {
        base_voltage_enabled: Parameter::new(device.base_voltage_enabled()?),
        fan_off_temp: Parameter::new(device.fan_off_temp()?),
        fan_on_temp: Parameter::new(device.fan_on_temp()?),
        shutdown_temp: Parameter::new(device.shutdown_temp()?),
        temp_sensor: Parameter::new(device.temp_sensor()?),
        status: device.controller_status()?,
        processor_temp: device.processor_temp()?,
        board_temp: device.board_temp()?,
        power_supply_temp: device.power_supply_temp()?,
        low_voltage: device.low_voltage()?,
        base_voltage: device.base_voltage()?,
    })
}

pub fn read_controller_updates(device: &mut Device) -> Result<ControllerUpdates, DeviceError> {
    Ok(ControllerUpdates {
        base_voltage_enabled: device.base_voltage_enabled()?,
        fan_off_temp: device.fan_off_temp()?,
        fan_on_temp: device.fan_on_temp()?,
        shutdown_temp: device.shutdown_temp()?,
        temp_sensor: device.temp_sensor()?,
        status: device.controller_status()?,
        processor_temp: device.processor_temp()?,
        board_temp: device.board_temp()?,
        power_supply_temp: device.power_supply_temp()?,
        low_voltage: device.low_voltage()?,
        base_voltage: device.base_voltage()?,
    })
}

/// Initial full read: the whole board, values and session constants.
pub fn read_device_state(device: &mut Device) -> Result<DeviceState, DeviceError> {
    let controller = read_controller_state(device)?;
    let cells = (1..=device.cell_count())
        .map(|cell| read_cell_state(device, cell))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(DeviceState {
        address: device.address().clone(),
        controller,
        cells,
    })
}

/// One poll's worth of the whole board.
pub fn read_device_updates(
    device: &mut Device,
) -> Result<(ControllerUpdates, Vec<CellUpdates>), DeviceError> {
    let controller = read_controller_updates(device)?;
    let cells = (1..=device.cell_count())
        .map(|cell| read_cell_updates(device, cell))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((controller, cells))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_cell() -> CellState {
        CellState {
            enabled: Parameter::new(false),
            voltage_set: Parameter::new(0.0),
            current_limit: Parameter::new(10.0),
            ramp_up_speed: Parameter::new(1),
            ramp_down_speed: Parameter::new(1),
            voltage_measured: 0.0,
            current_measured: 0.0,
            csr: CellCsr::empty(),
            cell_index: 1,
            counter_number: String::new(),
            auto_enable: false,
            voltage_range: (0.0, 3000.0),
            current_limit_range: (0.0, 100.0),
            measured_voltage_range: (0.0, 1000.0),
            measured_current_range: (0.0, 100.0),
        }
    }

    fn sample_settings() -> CellSettings {
        CellSettings {
            enabled: true,
            voltage_set: 50.0,
            current_limit: 20.0,
            ramp_up_speed: 5,
            ramp_down_speed: 3,
            counter_number: "c-17".to_string(),
            auto_enable: true,
        }
    }

    #[test]
    fn poll_overwrites_idle_cell() {
        let mut cell = sample_cell();
        cell.apply_updates(&CellUpdates {
            enabled: true,
            voltage_set: 120.0,
            current_limit: 15.0,
            ramp_up_speed: 2,
            ramp_down_speed: 2,
            voltage_measured: 119.5,
            current_measured: 1.25,
            csr: CellCsr::CHANNEL_ON,
        });
        assert_eq!(cell.voltage_set.desired(), 120.0);
        assert_eq!(cell.voltage_set.actual(), 120.0);
        assert!(cell.enabled.actual());
        assert_eq!(cell.voltage_measured, 119.5);
        assert_eq!(cell.csr, CellCsr::CHANNEL_ON);
    }

    #[test]
    fn compound_write_lifecycle() {
        let mut cell = sample_cell();
        let settings = sample_settings();
        cell.start_settings(&settings);
        for pending in [
            cell.enabled.pending(),
            cell.voltage_set.pending(),
            cell.current_limit.pending(),
            cell.ramp_up_speed.pending(),
            cell.ramp_down_speed.pending(),
        ] {
            assert_eq!(pending, 1);
        }
        assert_eq!(cell.voltage_set.desired(), 50.0);
        assert_eq!(cell.counter_number, "c-17");
        assert!(cell.auto_enable);

        // A poll in between must not disturb desired values.
        cell.apply_updates(&CellUpdates {
            enabled: false,
            voltage_set: 0.0,
            current_limit: 10.0,
            ramp_up_speed: 1,
            ramp_down_speed: 1,
            voltage_measured: 0.1,
            current_measured: 0.0,
            csr: CellCsr::empty(),
        });
        assert_eq!(cell.voltage_set.desired(), 50.0);
        assert_eq!(cell.voltage_set.actual(), 0.0);

        // Completion applies echoes, not requested values.
        let mut echoes = settings;
        echoes.voltage_set = 49.8;
        cell.complete_settings(&echoes);
        assert_eq!(cell.voltage_set.actual(), 49.8);
        assert_eq!(cell.voltage_set.desired(), 50.0);
        assert_eq!(cell.voltage_set.pending(), 0);
    }

    #[test]
    fn controller_poll_reconciles_parameters() {
        let mut controller = ControllerState {
            base_voltage_enabled: Parameter::new(false),
            fan_off_temp: Parameter::new(40),
            fan_on_temp: Parameter::new(50),
            shutdown_temp: Parameter::new(60),
            temp_sensor: Parameter::new(TemperatureSensor::Processor),
            status: ControllerStatus::empty(),
            processor_temp: 30,
            board_temp: 28,
            power_supply_temp: 35,
            low_voltage: 4.9,
            base_voltage: 12.0,
        };
        controller.fan_on_temp.write_start(55);
        controller.apply_updates(&ControllerUpdates {
            base_voltage_enabled: true,
            fan_off_temp: 42,
            fan_on_temp: 50,
            shutdown_temp: 61,
            temp_sensor: TemperatureSensor::Board,
            status: ControllerStatus::LOW_VOLTAGE_ERROR,
            processor_temp: 31,
            board_temp: 29,
            power_supply_temp: 36,
            low_voltage: 4.8,
            base_voltage: 12.1,
        });
        // The pending fan-on write keeps its desired value.
        assert_eq!(controller.fan_on_temp.desired(), 55);
        assert_eq!(controller.fan_on_temp.actual(), 50);
        // Everything else follows the poll.
        assert_eq!(controller.fan_off_temp.desired(), 42);
        assert_eq!(controller.shutdown_temp.actual(), 61);
        assert_eq!(controller.temp_sensor.actual(), TemperatureSensor::Board);
        assert_eq!(controller.status, ControllerStatus::LOW_VOLTAGE_ERROR);
        assert_eq!(controller.low_voltage, 4.8);
    }
}
