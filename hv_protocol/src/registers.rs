// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Register catalog for the controller bank and the per-cell banks.
//!
//! Codes and bit assignments come from the board firmware's register map.
//! Registers marked constant below never change within one TCP session and
//! are eligible for the session's read-through cache.

use bitflags::bitflags;
use enumn::N;
use serde::Deserialize;
use serde::Serialize;

/// Bank number of the controller register bank. Cells use banks 1..N.
pub const CONTROLLER_BANK: u8 = 0;

/// Registers of the global controller bank.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ControllerRegister {
    /// (readonly) Board identity word, constant 0x800e.
    BoardId = 0x00,
    /// (readonly) Status word, see [`ControllerStatus`].
    Status = 0x01,
    /// Switches the base voltage supply on (1) or off (0).
    BaseVoltageOn = 0x02,
    /// (readonly) Processor temperature, degrees C.
    ProcessorTemp = 0x03,
    /// (readonly) Board sensor temperature, degrees C.
    BoardTemp = 0x04,
    /// (readonly) Power supply sensor temperature, degrees C.
    PowerSupplyTemp = 0x05,
    /// (readonly) Low-voltage supply readout, volts times ten.
    LowVoltage = 0x06,
    /// (readonly) Base voltage readout, volts times ten.
    BaseVoltage = 0x07,
    /// Temperature at which the module fan switches off, degrees C.
    FanOffTemp = 0x10,
    /// Temperature at which the module fan switches on, degrees C.
    FanOnTemp = 0x11,
    /// Temperature at which all cells are switched off, degrees C.
    ShutdownTemp = 0x12,
    /// Low-voltage absolute lower limit, same units as `LowVoltage`.
    LowVoltageLowerLimit = 0x13,
    /// Low-voltage absolute upper limit.
    LowVoltageUpperLimit = 0x14,
    /// Base-voltage absolute lower limit, same units as `BaseVoltage`.
    BaseVoltageLowerLimit = 0x15,
    /// Base-voltage absolute upper limit.
    BaseVoltageUpperLimit = 0x16,
    /// Firmware verifies request checksums while this is non-zero.
    CheckCrc = 0x17,
    /// Selects the sensor driving temperature control, see
    /// [`TemperatureSensor`].
    TempSensorSelect = 0x18,
    /// (readonly) Controller serial number.
    SerialNumber = 0x19,
    /// (write only) Writing any value stores the configuration in flash.
    WriteFlash = 0x1f,
}

impl ControllerRegister {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Registers of one cell bank.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CellRegister {
    CellId = 0,
    /// Control/status word, see [`CellCsr`]. Bit 0 switches the output.
    ControlStatus = 1,
    /// Output voltage setpoint, 12-bit DAC code.
    VoltageSet = 2,
    /// (readonly) Measured output voltage, 12-bit ADC code.
    VoltageMeasured = 3,
    /// Current limit setpoint, 10-bit DAC code.
    CurrentLimit = 4,
    /// (readonly) Measured current, 12-bit ADC code.
    CurrentMeasured = 5,
    /// Standby-regime output voltage, DAC code.
    StandbyVoltage = 6,
    /// Ramp-up speed, volts per second.
    RampUpSpeed = 7,
    /// Ramp-down speed, volts per second.
    RampDownSpeed = 8,
    /// Delay before standby voltage engages after a current overload.
    ProtectionDelay = 9,
    /// Constant: real output voltage at DAC code 0, volts.
    VoltageAtZeroCode = 10,
    /// Constant: real output voltage at the maximal DAC code, volts.
    VoltageAtMaxCode = 11,
    /// Constant: current threshold at the maximal DAC code, microamperes.
    CurrentLimitMax = 12,
    /// Constant: calibrated voltage at the maximal ADC code, volts.
    VoltageMeasuredMax = 13,
    /// Constant: calibrated current at the maximal ADC code, microamperes.
    CurrentMeasuredMax = 14,
    /// (readonly) Polarity flag and converter bit widths, packed.
    SignAndWidths = 15,
    /// Lower error threshold of the cell. Factory calibration.
    VoltageOkMin = 16,
    /// Upper error threshold of the cell. Factory calibration.
    VoltageOkMax = 17,
    /// Error threshold of the current limiting scheme. Factory calibration.
    CurrentOkMin = 18,
    /// Lower error threshold of the cell's base voltage supply.
    BaseVoltageOkMin = 19,
    /// Firmware verifies request checksums while this is non-zero.
    CheckCrc = 20,
    /// Store the voltage setpoint in EEPROM and restore it on boot.
    KeepVoltageSet = 21,
    /// Switch the output on at power-up (standalone operation).
    EnableOnBoot = 22,
    /// Switch the output off when current overload protection fires.
    DisableOnOverload = 23,
    /// (readonly) Measured current, second (coarse) channel, ADC code.
    CurrentMeasured2 = 24,
    /// Constant: calibrated current at the maximal ADC code of the second
    /// channel, microamperes.
    CurrentMeasured2Max = 25,
}

impl CellRegister {
    pub fn code(self) -> u8 {
        self as u8
    }
}

bitflags! {
    /// Cell control/status word.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct CellCsr: u16 {
        /// Controls and reflects the on/off state of the output.
        const CHANNEL_ON = 1 << 0;
        const ERROR = 1 << 1;
        /// Error accumulated since the last read of this word.
        const ACCUMULATED_ERROR = 1 << 2;
        /// Output current is being limited.
        const CURRENT_OVERLOAD = 1 << 3;
        const BASE_VOLTAGE_ERROR = 1 << 4;
        const HARDWARE_FAILURE = 1 << 5;
        const RAMP_UP_ACTIVE = 1 << 6;
        const RAMP_DOWN_ACTIVE = 1 << 7;
        const STANDBY = 1 << 8;
        /// Cleared by writing a new voltage setpoint or re-enabling HV.
        const IO_PROTECTION = 1 << 9;
    }
}

bitflags! {
    /// Controller status word.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ControllerStatus: u16 {
        const TEMPERATURE_PROTECTION = 1 << 0;
        const LOW_VOLTAGE_ERROR = 1 << 1;
        const BASE_VOLTAGE_ERROR = 1 << 2;
        const HIGH_VOLTAGE_PROTECTION_ACTIVE = 1 << 3;
    }
}

/// Sensor selectable through [`ControllerRegister::TempSensorSelect`].
#[derive(Clone, Copy, Debug, Deserialize, Eq, N, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u16)]
pub enum TemperatureSensor {
    Processor = 0,
    Board = 1,
    PowerSupply = 2,
}

impl TemperatureSensor {
    pub fn code(self) -> u16 {
        self as u16
    }
}
