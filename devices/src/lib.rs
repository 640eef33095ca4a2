// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Supervision of multichannel high-voltage source boards.
//!
//! Each board gets one [`supervisor`] worker thread that owns the TCP
//! session and the in-memory mirror of the board's registers. The worker
//! serializes all protocol I/O, reconciles operator intent with device
//! acknowledgements through three-valued [`Parameter`] cells, polls the
//! board periodically, and publishes typed events for the front end. The
//! [`fault`] module grades mirror snapshots into a severity summary.

use std::fmt;
use std::io;

use hv_protocol::ConversionError;
use hv_protocol::DecodeError;
use remain::sorted;
use thiserror::Error;

pub mod fault;
mod mirror;
mod parameter;
pub mod profile;
mod session;
pub mod supervisor;

pub use mirror::{
    CellConstants, CellSettings, CellState, CellUpdates, ControllerState, ControllerUpdates,
    DeviceState,
};
pub use parameter::Parameter;
pub use session::{Device, Session};

/// Network identity of one board.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceAddress {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.name, self.host, self.port)
    }
}

/// A rejected parameter write, with the range that rejected it.
#[derive(Clone, Debug, PartialEq)]
pub struct OutOfRange {
    /// Cell index, numbering from one.
    pub cell_index: usize,
    pub parameter: &'static str,
    pub value: f64,
    pub low: f64,
    pub high: f64,
}

impl fmt::Display for OutOfRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cell #{}: cannot set {} to {} (allowed range is {}..{})",
            self.cell_index, self.parameter, self.value, self.low, self.high
        )
    }
}

#[sorted]
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Calibration constants read from the device do not form a valid
    /// conversion line.
    #[error("invalid device calibration: {0}")]
    BadCalibration(#[from] ConversionError),
    #[error("invalid cell index {index} (device has {count} cells)")]
    BadCellIndex { index: usize, count: usize },
    /// The supervisor accepting this command has shut down.
    #[error("command submitted after shutdown")]
    Cancelled,
    /// Connect-time failure; no mirror was published.
    #[error("Failed to connect to {address}: {reason}")]
    Connection { address: DeviceAddress, reason: String },
    #[error("malformed response: {0}")]
    MalformedResponse(#[from] DecodeError),
    #[error("{0}")]
    OutOfRange(OutOfRange),
    #[error("Remote device closed connection")]
    PeerClosed,
    #[error("request timed out")]
    Timeout,
    #[error("socket error: {0}")]
    Transport(io::Error),
}

impl DeviceError {
    /// True for errors that end the session: after one of these the
    /// supervisor transitions to connection-lost and drains its queue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DeviceError::MalformedResponse(_)
                | DeviceError::PeerClosed
                | DeviceError::Timeout
                | DeviceError::Transport(_)
        )
    }
}
