// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Grades mirror snapshots into a totally ordered severity summary.
//!
//! All checks are pure functions over mirror state; no I/O happens here. A
//! cell's grade is the maximum over its individual checks, a device's grade
//! the maximum over its controller and cells.

use std::fmt;

use serde::Deserialize;

use crate::CellState;
use crate::ControllerState;
use crate::Parameter;

/// Severity summary, ordered from quietest to loudest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorGrade {
    Ok,
    /// Informational uplift: the output is enabled and healthy.
    Good,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for ErrorGrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorGrade::Ok => "ok",
            ErrorGrade::Good => "good",
            ErrorGrade::Warning => "warning",
            ErrorGrade::Error => "error",
            ErrorGrade::Critical => "critical",
        };
        write!(f, "{}", text)
    }
}

/// Thresholds for the measured-voltage plausibility checks.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct CheckSettings {
    /// Maximal allowed difference between set and measured voltage while
    /// the output is enabled, volts.
    pub max_voltage_difference: f64,
    /// Maximal plausible measured voltage while the output is off, volts.
    pub max_voltage_when_off: f64,
}

impl Default for CheckSettings {
    fn default() -> CheckSettings {
        CheckSettings {
            max_voltage_difference: 1.0,
            max_voltage_when_off: 10.0,
        }
    }
}

fn in_range(value: f64, range: (f64, f64)) -> bool {
    range.0 <= value && value <= range.1
}

fn check_actual_voltage_set(state: &CellState) -> ErrorGrade {
    if !in_range(state.voltage_set.actual(), state.voltage_range) {
        return ErrorGrade::Critical;
    }
    ErrorGrade::Ok
}

fn check_measured_voltage(state: &CellState, settings: &CheckSettings) -> ErrorGrade {
    let v_set = state.voltage_set.actual();
    let v_mes = state.voltage_measured;
    if !in_range(v_mes, state.measured_voltage_range) {
        return ErrorGrade::Critical;
    }
    if state.enabled.actual() && (v_set - v_mes).abs() >= settings.max_voltage_difference {
        return ErrorGrade::Error;
    }
    if !state.enabled.actual() && v_mes > settings.max_voltage_when_off {
        return ErrorGrade::Error;
    }
    ErrorGrade::Ok
}

fn check_measured_current(state: &CellState) -> ErrorGrade {
    if !in_range(state.current_measured, state.measured_current_range) {
        return ErrorGrade::Critical;
    }
    if state.current_measured > state.current_limit.actual() {
        return ErrorGrade::Error;
    }
    ErrorGrade::Ok
}

fn check_cell_status(state: &CellState) -> ErrorGrade {
    use hv_protocol::CellCsr;
    let bad = CellCsr::CURRENT_OVERLOAD
        | CellCsr::BASE_VOLTAGE_ERROR
        | CellCsr::HARDWARE_FAILURE
        | CellCsr::STANDBY
        | CellCsr::IO_PROTECTION;
    if state.csr.intersects(bad) {
        return ErrorGrade::Error;
    }
    ErrorGrade::Ok
}

fn check_parameter<T: Copy>(parameter: &Parameter<T>) -> ErrorGrade {
    if parameter.pending() > 0 {
        ErrorGrade::Warning
    } else {
        ErrorGrade::Ok
    }
}

fn good_if_output_enabled(state: &CellState) -> ErrorGrade {
    if state.enabled.actual() {
        ErrorGrade::Good
    } else {
        ErrorGrade::Ok
    }
}

/// Grades one cell.
pub fn check_cell(state: &CellState, settings: &CheckSettings) -> ErrorGrade {
    [
        check_actual_voltage_set(state),
        check_measured_voltage(state, settings),
        check_measured_current(state),
        check_cell_status(state),
        check_parameter(&state.voltage_set),
        check_parameter(&state.current_limit),
        check_parameter(&state.enabled),
        check_parameter(&state.ramp_up_speed),
        check_parameter(&state.ramp_down_speed),
        good_if_output_enabled(state),
    ]
    .into_iter()
    .max()
    .unwrap_or(ErrorGrade::Ok)
}

/// Grades the controller: pending temperature writes warn, any status bit
/// is an error.
pub fn check_controller(state: &ControllerState) -> ErrorGrade {
    let status = if state.status.is_empty() {
        ErrorGrade::Ok
    } else {
        ErrorGrade::Error
    };
    [
        check_parameter(&state.fan_off_temp),
        check_parameter(&state.fan_on_temp),
        check_parameter(&state.shutdown_temp),
        status,
    ]
    .into_iter()
    .max()
    .unwrap_or(ErrorGrade::Ok)
}

/// Grades a whole device from its controller and cell states.
pub fn check_device<'a>(
    controller: &ControllerState,
    cells: impl Iterator<Item = &'a CellState>,
    settings: &CheckSettings,
) -> ErrorGrade {
    let cell_grade = cells
        .map(|cell| check_cell(cell, settings))
        .max()
        .unwrap_or(ErrorGrade::Ok);
    check_controller(controller).max(cell_grade)
}
