// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Request/response codec for the board's ASCII register protocol.
//!
//! Requests are single lines: `r<bank:2><reg:2><crc:1>\n` for reads and
//! `w<bank:2><reg:2><data:4><crc:1>\n` for writes, all fields lowercase
//! hex. Responses are always exactly [`RESPONSE_LENGTH`] bytes:
//! `<data:4><crc:1>\n`. The checksum is a nibble computed over the hex
//! digits of the payload (the command letter is excluded); when checksum
//! verification is disabled the sentinel digit `0` is sent instead.

use remain::sorted;
use thiserror::Error;

/// Exact size of a response frame, newline included.
pub const RESPONSE_LENGTH: usize = 6;

#[sorted]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("response contains a non-hex digit")]
    BadHexDigit,
    #[error("response is {0} bytes, expected {RESPONSE_LENGTH}")]
    BadLength(usize),
    #[error("response is not newline-terminated")]
    MissingNewline,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    Write,
}

/// One request frame, not yet encoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Request {
    pub kind: RequestKind,
    /// Register bank: 0 for the controller, 1..N for cells.
    pub bank: u8,
    pub register: u8,
    /// Payload of a write; ignored for reads.
    pub data: u16,
    /// When false, the CRC sentinel `0` is sent instead of a checksum.
    pub check_crc: bool,
}

impl Request {
    pub fn read(bank: u8, register: u8) -> Request {
        Request {
            kind: RequestKind::Read,
            bank,
            register,
            data: 0,
            check_crc: true,
        }
    }

    pub fn write(bank: u8, register: u8, data: u16) -> Request {
        Request {
            kind: RequestKind::Write,
            bank,
            register,
            data,
            check_crc: true,
        }
    }
}

/// A decoded response frame.
///
/// A checksum mismatch does not invalidate the frame; `crc_ok` is reported
/// alongside the value so callers can decide how loudly to complain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Response {
    pub data: u16,
    pub crc_ok: bool,
}

/// Reduces a sum of hex-digit values to the protocol's checksum nibble.
pub fn crc_nibble(digit_sum: u32) -> u8 {
    ((digit_sum ^ 0xf) & 0xf) as u8
}

fn nibble_sum(value: u32, digits: u32) -> u32 {
    (0..digits).map(|i| (value >> (4 * i)) & 0xf).sum()
}

fn hex_value(byte: u8) -> Result<u32, DecodeError> {
    match byte {
        b'0'..=b'9' => Ok(u32::from(byte - b'0')),
        b'a'..=b'f' => Ok(u32::from(byte - b'a') + 10),
        b'A'..=b'F' => Ok(u32::from(byte - b'A') + 10),
        _ => Err(DecodeError::BadHexDigit),
    }
}

/// Encodes a request into the line sent on the wire, newline included.
pub fn encode_request(request: &Request) -> String {
    let (letter, payload, payload_sum) = match request.kind {
        RequestKind::Read => (
            'r',
            format!("{:02x}{:02x}", request.bank, request.register),
            nibble_sum(u32::from(request.bank), 2) + nibble_sum(u32::from(request.register), 2),
        ),
        RequestKind::Write => (
            'w',
            format!(
                "{:02x}{:02x}{:04x}",
                request.bank, request.register, request.data
            ),
            nibble_sum(u32::from(request.bank), 2)
                + nibble_sum(u32::from(request.register), 2)
                + nibble_sum(u32::from(request.data), 4),
        ),
    };
    let crc = if request.check_crc {
        crc_nibble(payload_sum)
    } else {
        0
    };
    format!("{}{}{:x}\n", letter, payload, crc)
}

/// Decodes a raw response frame.
///
/// The frame must be exactly [`RESPONSE_LENGTH`] bytes ending in a newline;
/// anything else is a framing error. The checksum over the five payload
/// digits must reduce to zero for `crc_ok` to hold.
pub fn decode_response(raw: &[u8]) -> Result<Response, DecodeError> {
    if raw.len() != RESPONSE_LENGTH {
        return Err(DecodeError::BadLength(raw.len()));
    }
    if raw[RESPONSE_LENGTH - 1] != b'\n' {
        return Err(DecodeError::MissingNewline);
    }
    let mut digits = [0u32; RESPONSE_LENGTH - 1];
    for (slot, byte) in digits.iter_mut().zip(raw.iter()) {
        *slot = hex_value(*byte)?;
    }
    let data = (digits[0] << 12 | digits[1] << 8 | digits[2] << 4 | digits[3]) as u16;
    let crc_ok = crc_nibble(digits.iter().sum()) == 0;
    Ok(Response { data, crc_ok })
}
