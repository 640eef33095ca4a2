// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Linear conversions between converter codes and engineering units.
//!
//! Every calibrated quantity on the board is a straight line through two
//! points: code 0 maps to `min_value` and `max_code` maps to `max_value`.
//! The calibration endpoints live in per-cell constant registers; converter
//! widths are fixed by the hardware.

use remain::sorted;
use thiserror::Error;

/// Maximal code of the 12-bit voltage DAC.
pub const VOLTAGE_DAC_MAX: u16 = (1 << 12) - 1;
/// Maximal code of the 10-bit current-limit DAC.
pub const CURRENT_DAC_MAX: u16 = (1 << 10) - 1;
/// Maximal code of the 12-bit voltage ADC.
pub const VOLTAGE_ADC_MAX: u16 = (1 << 12) - 1;
/// Maximal code of the 12-bit current ADC.
pub const CURRENT_ADC_MAX: u16 = (1 << 12) - 1;

#[sorted]
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum ConversionError {
    #[error("max_code should be strictly greater than 0 (max_code = {0})")]
    BadMaxCode(u16),
    #[error(
        "min_value should be strictly less than max_value \
         (min_value = {min}, max_value = {max})"
    )]
    BadRange { min: f64, max: f64 },
}

fn check_calibration(max_code: u16, min_value: f64, max_value: f64) -> Result<(), ConversionError> {
    if min_value >= max_value {
        return Err(ConversionError::BadRange {
            min: min_value,
            max: max_value,
        });
    }
    if max_code == 0 {
        return Err(ConversionError::BadMaxCode(max_code));
    }
    Ok(())
}

/// Converts a raw converter code to its engineering value.
///
/// Codes above `max_code` are not rejected; the line extends monotonically
/// and the caller decides whether to complain.
pub fn code_to_value(
    code: u16,
    max_code: u16,
    min_value: f64,
    max_value: f64,
) -> Result<f64, ConversionError> {
    check_calibration(max_code, min_value, max_value)?;
    Ok(min_value + f64::from(code) / f64::from(max_code) * (max_value - min_value))
}

/// Converts an engineering value to the nearest converter code.
///
/// The caller is responsible for rejecting values outside
/// `[min_value, max_value]` first; this function does not clamp.
pub fn value_to_code(
    value: f64,
    max_code: u16,
    min_value: f64,
    max_value: f64,
) -> Result<u16, ConversionError> {
    check_calibration(max_code, min_value, max_value)?;
    Ok(((value - min_value) / (max_value - min_value) * f64::from(max_code)).round() as u16)
}
