// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Wire protocol for multichannel high-voltage source boards.
//!
//! The boards speak a line-oriented ASCII register protocol over TCP: each
//! request names a register bank (bank 0 is the controller, banks 1..N are
//! the output cells), an 8-bit register index, and for writes a 16-bit
//! value, all in lowercase hex, protected by a one-nibble XOR checksum.
//! This crate contains the codec, the register catalog, and the linear
//! code/engineering-unit conversions; it performs no I/O.

mod codec;
mod registers;
mod units;

pub use codec::{
    crc_nibble, decode_response, encode_request, DecodeError, Request, RequestKind, Response,
    RESPONSE_LENGTH,
};
pub use registers::{
    CellCsr, CellRegister, ControllerRegister, ControllerStatus, TemperatureSensor, CONTROLLER_BANK,
};
pub use units::{
    code_to_value, value_to_code, ConversionError, CURRENT_ADC_MAX, CURRENT_DAC_MAX,
    VOLTAGE_ADC_MAX, VOLTAGE_DAC_MAX,
};
