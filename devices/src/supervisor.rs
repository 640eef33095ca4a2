// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-device supervisor: one worker thread owning the session and mirror.
//!
//! The worker serializes all protocol I/O for its board. Commands arrive as
//! typed messages over a channel and execute in submit order; a poll of the
//! board's mutable registers runs every [`POLL_INTERVAL`] between commands.
//! Mirror mutation happens only on the worker, after the I/O that justifies
//! it; the front end sees state exclusively through cloned snapshots
//! carried by [`DeviceEvent`]s.
//!
//! Command submission is validated on the caller's thread against the
//! session constants captured at connect time, then dispatched. After a
//! fatal protocol error or an explicit close, further submissions fail with
//! [`DeviceError::Cancelled`] and queued work is discarded without touching
//! the mirror.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use hv_protocol::CellRegister;
use hv_protocol::ControllerRegister;
use hv_protocol::TemperatureSensor;
use log::debug;
use log::error;
use log::info;
use serde::Deserialize;

use crate::mirror;
use crate::CellConstants;
use crate::CellSettings;
use crate::CellState;
use crate::ControllerState;
use crate::Device;
use crate::DeviceAddress;
use crate::DeviceError;
use crate::DeviceState;
use crate::OutOfRange;
use crate::Parameter;

/// Number of cells on a deployed board.
pub const CHANNEL_COUNT: usize = 16;
/// Connect and per-request timeout.
pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(10);
/// Period of the background register poll.
pub const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Register values written to a board every time it is connected.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct DefaultValues {
    /// Written to the controller bank, in ascending register order.
    pub controller: BTreeMap<ControllerRegister, u16>,
    /// Written to every cell bank, in ascending register order.
    pub cell: BTreeMap<CellRegister, u16>,
}

#[derive(Clone, Debug)]
pub struct SupervisorOptions {
    pub cell_count: usize,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub defaults: DefaultValues,
}

impl Default for SupervisorOptions {
    fn default() -> SupervisorOptions {
        SupervisorOptions {
            cell_count: CHANNEL_COUNT,
            request_timeout: SOCKET_TIMEOUT,
            poll_interval: POLL_INTERVAL,
            defaults: DefaultValues::default(),
        }
    }
}

/// Connection lifecycle, as observed by the front end.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Connecting,
    WritingDefaults,
    ReadingState,
    Connected,
    ConnectionLost,
    Shutdown,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            LifecycleState::Connecting => "connecting",
            LifecycleState::WritingDefaults => "writing defaults",
            LifecycleState::ReadingState => "reading state",
            LifecycleState::Connected => "connected",
            LifecycleState::ConnectionLost => "connection lost",
            LifecycleState::Shutdown => "shutdown",
        };
        write!(f, "{}", text)
    }
}

/// Payload of one supervisor event.
#[derive(Clone, Debug)]
pub enum EventKind {
    StateChanged(LifecycleState),
    /// A cell's mirror changed; carries a snapshot of the new state.
    CellUpdated { cell_index: usize, state: CellState },
    /// The controller mirror changed; carries a snapshot.
    ControllerUpdated { state: ControllerState },
    /// End of one polling pass, after all per-cell events.
    Updated,
    /// The session is gone; the supervisor has shut down.
    ConnectionError { message: String },
}

#[derive(Clone, Debug)]
pub struct DeviceEvent {
    pub device: DeviceAddress,
    pub kind: EventKind,
}

pub type EventSender = mpsc::Sender<DeviceEvent>;

enum Command {
    SetEnabled { cell: usize, value: bool },
    SetVoltage { cell: usize, value: f64 },
    SetCurrentLimit { cell: usize, value: f64 },
    SetRampUpSpeed { cell: usize, value: u16 },
    SetRampDownSpeed { cell: usize, value: u16 },
    SetBaseVoltageEnabled { value: bool },
    SetFanOffTemp { value: u16 },
    SetFanOnTemp { value: u16 },
    SetShutdownTemp { value: u16 },
    SetTempSensor { value: TemperatureSensor },
    /// One entry per cell; `None` disables the cell.
    ApplyProfile { settings: Vec<Option<CellSettings>> },
    Shutdown,
}

/// Starts a supervisor for one board.
///
/// The returned [`PendingConnection`] resolves once the worker has
/// connected, written the configured defaults, and completed the initial
/// full state read; on any failure along that path it resolves to
/// [`DeviceError::Connection`] and no mirror is published.
pub fn connect(
    address: DeviceAddress,
    options: SupervisorOptions,
    events: EventSender,
) -> PendingConnection {
    let (ready_tx, ready_rx) = mpsc::channel();
    let worker_address = address.clone();
    let spawned = thread::Builder::new()
        .name(format!("device_{}", address.name))
        .spawn(move || worker_entry(worker_address, options, events, ready_tx));
    if let Err(e) = spawned {
        error!("Failed to spawn worker for {}: {}", address, e);
    }
    PendingConnection {
        address,
        ready: ready_rx,
    }
}

/// The not-yet-resolved result of [`connect`].
pub struct PendingConnection {
    address: DeviceAddress,
    ready: mpsc::Receiver<Result<SupervisorHandle, DeviceError>>,
}

impl PendingConnection {
    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    /// Blocks until the connect pipeline finishes.
    pub fn wait(self) -> Result<SupervisorHandle, DeviceError> {
        match self.ready.recv() {
            Ok(result) => result,
            Err(_) => Err(DeviceError::Connection {
                address: self.address,
                reason: "worker exited before reporting".to_string(),
            }),
        }
    }
}

/// Front-end handle to one supervisor.
///
/// All command operations validate on the calling thread, then enqueue;
/// they return as soon as the command is accepted. Results surface as
/// events.
pub struct SupervisorHandle {
    address: DeviceAddress,
    constants: Vec<CellConstants>,
    commands: mpsc::Sender<Command>,
    shut: Arc<AtomicBool>,
}

impl SupervisorHandle {
    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    pub fn cell_count(&self) -> usize {
        self.constants.len()
    }

    /// Session constants of one cell, for display and validation.
    pub fn cell_constants(&self, cell: usize) -> Result<&CellConstants, DeviceError> {
        cell.checked_sub(1)
            .and_then(|i| self.constants.get(i))
            .ok_or(DeviceError::BadCellIndex {
                index: cell,
                count: self.constants.len(),
            })
    }

    fn submit(&self, command: Command) -> Result<(), DeviceError> {
        if self.shut.load(Ordering::Acquire) {
            return Err(DeviceError::Cancelled);
        }
        self.commands.send(command).map_err(|_| DeviceError::Cancelled)
    }

    pub fn set_enabled(&self, cell: usize, value: bool) -> Result<(), DeviceError> {
        self.cell_constants(cell)?;
        self.submit(Command::SetEnabled { cell, value })
    }

    pub fn set_output_voltage(&self, cell: usize, value: f64) -> Result<(), DeviceError> {
        check_voltage_value(cell, self.cell_constants(cell)?, value)?;
        self.submit(Command::SetVoltage { cell, value })
    }

    pub fn set_current_limit(&self, cell: usize, value: f64) -> Result<(), DeviceError> {
        check_current_value(cell, self.cell_constants(cell)?, value)?;
        self.submit(Command::SetCurrentLimit { cell, value })
    }

    pub fn set_ramp_up_speed(&self, cell: usize, value: u16) -> Result<(), DeviceError> {
        self.cell_constants(cell)?;
        check_ramp_value(cell, "ramp up speed", value)?;
        self.submit(Command::SetRampUpSpeed { cell, value })
    }

    pub fn set_ramp_down_speed(&self, cell: usize, value: u16) -> Result<(), DeviceError> {
        self.cell_constants(cell)?;
        check_ramp_value(cell, "ramp down speed", value)?;
        self.submit(Command::SetRampDownSpeed { cell, value })
    }

    pub fn set_base_voltage_enabled(&self, value: bool) -> Result<(), DeviceError> {
        self.submit(Command::SetBaseVoltageEnabled { value })
    }

    pub fn set_fan_off_temp(&self, value: u16) -> Result<(), DeviceError> {
        self.submit(Command::SetFanOffTemp { value })
    }

    pub fn set_fan_on_temp(&self, value: u16) -> Result<(), DeviceError> {
        self.submit(Command::SetFanOnTemp { value })
    }

    pub fn set_shutdown_temp(&self, value: u16) -> Result<(), DeviceError> {
        self.submit(Command::SetShutdownTemp { value })
    }

    pub fn set_temp_sensor(&self, value: TemperatureSensor) -> Result<(), DeviceError> {
        self.submit(Command::SetTempSensor { value })
    }

    /// Applies a device profile: every cell listed in the profile gets all
    /// five parameters written; every other cell is disabled. All listed
    /// cells are validated first; if any fails, nothing is submitted.
    pub fn apply_device_profile(
        &self,
        profile: &crate::profile::DeviceProfile,
    ) -> Result<(), DeviceError> {
        let mut settings: Vec<Option<CellSettings>> = vec![None; self.constants.len()];
        for (&cell, cell_settings) in &profile.cell_settings {
            let constants = self.cell_constants(cell)?;
            check_voltage_value(cell, constants, cell_settings.voltage_set)?;
            check_current_value(cell, constants, cell_settings.current_limit)?;
            check_ramp_value(cell, "ramp up speed", cell_settings.ramp_up_speed)?;
            check_ramp_value(cell, "ramp down speed", cell_settings.ramp_down_speed)?;
            settings[cell - 1] = Some(cell_settings.clone());
        }
        self.submit(Command::ApplyProfile { settings })
    }

    /// Shuts the supervisor down without waiting for the queue to drain.
    /// Subsequent submissions fail with [`DeviceError::Cancelled`].
    pub fn close(&self) {
        self.shut.store(true, Ordering::Release);
        let _ = self.commands.send(Command::Shutdown);
    }
}

fn check_voltage_value(
    cell: usize,
    constants: &CellConstants,
    value: f64,
) -> Result<(), DeviceError> {
    let (low, high) = constants.voltage_range;
    if value < low || value > high {
        return Err(DeviceError::OutOfRange(OutOfRange {
            cell_index: cell,
            parameter: "voltage",
            value,
            low,
            high,
        }));
    }
    Ok(())
}

fn check_current_value(
    cell: usize,
    constants: &CellConstants,
    value: f64,
) -> Result<(), DeviceError> {
    let (low, high) = constants.current_limit_range;
    if value < low || value > high {
        return Err(DeviceError::OutOfRange(OutOfRange {
            cell_index: cell,
            parameter: "current limit",
            value,
            low,
            high,
        }));
    }
    Ok(())
}

fn check_ramp_value(cell: usize, parameter: &'static str, value: u16) -> Result<(), DeviceError> {
    if value < 1 {
        return Err(DeviceError::OutOfRange(OutOfRange {
            cell_index: cell,
            parameter,
            value: f64::from(value),
            low: 1.0,
            high: f64::from(u16::MAX),
        }));
    }
    Ok(())
}

fn worker_entry(
    address: DeviceAddress,
    options: SupervisorOptions,
    events: EventSender,
    ready: mpsc::Sender<Result<SupervisorHandle, DeviceError>>,
) {
    let emit_state = |state: LifecycleState| {
        let _ = events.send(DeviceEvent {
            device: address.clone(),
            kind: EventKind::StateChanged(state),
        });
    };

    let (device, mirror) = match establish(&address, &options, &emit_state) {
        Ok(pair) => pair,
        Err(e) => {
            error!("Failed to connect to {}: {}", address, e);
            let _ = ready.send(Err(DeviceError::Connection {
                address,
                reason: e.to_string(),
            }));
            return;
        }
    };
    emit_state(LifecycleState::Connected);
    info!("Connected to {}", address);

    let (command_tx, command_rx) = mpsc::channel();
    let shut = Arc::new(AtomicBool::new(false));
    let handle = SupervisorHandle {
        address: address.clone(),
        constants: mirror.cells.iter().map(CellState::constants).collect(),
        commands: command_tx,
        shut: shut.clone(),
    };
    if ready.send(Ok(handle)).is_err() {
        // Nobody is waiting for this supervisor; stop before polling.
        return;
    }

    Worker {
        device,
        mirror,
        events,
        commands: command_rx,
        shut,
        poll_interval: options.poll_interval,
    }
    .run();
}

/// Connect pipeline: TCP connect, write defaults, initial full read.
fn establish(
    address: &DeviceAddress,
    options: &SupervisorOptions,
    emit_state: &impl Fn(LifecycleState),
) -> Result<(Device, DeviceState), DeviceError> {
    emit_state(LifecycleState::Connecting);
    debug!("Connecting to {}", address);
    let mut device = Device::connect(address.clone(), options.cell_count, options.request_timeout)?;

    emit_state(LifecycleState::WritingDefaults);
    debug!("Writing defaults to {}", address);
    for (&register, &value) in &options.defaults.controller {
        device.controller_write(register, value)?;
    }
    for cell in 1..=options.cell_count {
        for (&register, &value) in &options.defaults.cell {
            device.cell_write(cell, register, value)?;
        }
    }

    emit_state(LifecycleState::ReadingState);
    debug!("Reading state from {}", address);
    let mirror = mirror::read_device_state(&mut device)?;
    Ok((device, mirror))
}

struct Worker {
    device: Device,
    mirror: DeviceState,
    events: EventSender,
    commands: mpsc::Receiver<Command>,
    shut: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl Worker {
    fn run(mut self) {
        let mut next_poll = Instant::now() + self.poll_interval;
        loop {
            let now = Instant::now();
            if now >= next_poll {
                if let Err(e) = self.guard(Self::poll) {
                    self.connection_lost(e);
                    return;
                }
                // Rearm only after the pass completes, so polls never stack.
                next_poll = Instant::now() + self.poll_interval;
                continue;
            }
            match self.commands.recv_timeout(next_poll - now) {
                Ok(Command::Shutdown) => {
                    self.shutdown();
                    return;
                }
                Ok(command) => {
                    if let Err(e) = self.guard(|worker| worker.handle_command(command)) {
                        self.connection_lost(e);
                        return;
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    // Every handle is gone; nobody can command us anymore.
                    self.shutdown();
                    return;
                }
            }
        }
    }

    /// Runs one unit of work, swallowing (but logging) non-fatal errors.
    fn guard(
        &mut self,
        work: impl FnOnce(&mut Self) -> Result<(), DeviceError>,
    ) -> Result<(), DeviceError> {
        match work(self) {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                error!("{}: {}", self.mirror.address, e);
                Ok(())
            }
        }
    }

    fn emit(&self, kind: EventKind) {
        let _ = self.events.send(DeviceEvent {
            device: self.mirror.address.clone(),
            kind,
        });
    }

    fn emit_cell_updated(&self, cell: usize) {
        self.emit(EventKind::CellUpdated {
            cell_index: cell,
            state: self.mirror.cells[cell - 1].clone(),
        });
    }

    fn emit_controller_updated(&self) {
        self.emit(EventKind::ControllerUpdated {
            state: self.mirror.controller.clone(),
        });
    }

    fn handle_command(&mut self, command: Command) -> Result<(), DeviceError> {
        match command {
            Command::SetEnabled { cell, value } => self.modify_cell_parameter(
                cell,
                value,
                |state| &mut state.enabled,
                Device::set_cell_enabled,
            ),
            Command::SetVoltage { cell, value } => self.modify_cell_parameter(
                cell,
                value,
                |state| &mut state.voltage_set,
                Device::set_cell_output_voltage,
            ),
            Command::SetCurrentLimit { cell, value } => self.modify_cell_parameter(
                cell,
                value,
                |state| &mut state.current_limit,
                Device::set_cell_current_limit,
            ),
            Command::SetRampUpSpeed { cell, value } => self.modify_cell_parameter(
                cell,
                value,
                |state| &mut state.ramp_up_speed,
                Device::set_cell_ramp_up_speed,
            ),
            Command::SetRampDownSpeed { cell, value } => self.modify_cell_parameter(
                cell,
                value,
                |state| &mut state.ramp_down_speed,
                Device::set_cell_ramp_down_speed,
            ),
            Command::SetBaseVoltageEnabled { value } => self.modify_controller_parameter(
                value,
                |state| &mut state.base_voltage_enabled,
                Device::set_base_voltage_enabled,
            ),
            Command::SetFanOffTemp { value } => self.modify_controller_parameter(
                value,
                |state| &mut state.fan_off_temp,
                Device::set_fan_off_temp,
            ),
            Command::SetFanOnTemp { value } => self.modify_controller_parameter(
                value,
                |state| &mut state.fan_on_temp,
                Device::set_fan_on_temp,
            ),
            Command::SetShutdownTemp { value } => self.modify_controller_parameter(
                value,
                |state| &mut state.shutdown_temp,
                Device::set_shutdown_temp,
            ),
            Command::SetTempSensor { value } => self.modify_controller_parameter(
                value,
                |state| &mut state.temp_sensor,
                Device::set_temp_sensor,
            ),
            Command::ApplyProfile { settings } => self.apply_profile(settings),
            Command::Shutdown => Ok(()),
        }
    }

    /// Write-then-read-back for one cell parameter: record intent, emit the
    /// early event, perform the write, apply the echo.
    fn modify_cell_parameter<T: Copy>(
        &mut self,
        cell: usize,
        value: T,
        parameter: fn(&mut CellState) -> &mut Parameter<T>,
        write: fn(&mut Device, usize, T) -> Result<T, DeviceError>,
    ) -> Result<(), DeviceError> {
        debug!(
            "Starting modification of a parameter of cell {}[{}]",
            self.mirror.address.name, cell
        );
        parameter(&mut self.mirror.cells[cell - 1]).write_start(value);
        self.emit_cell_updated(cell);

        let echo = write(&mut self.device, cell, value)?;
        debug!(
            "Completing modification of a parameter of cell {}[{}]",
            self.mirror.address.name, cell
        );
        parameter(&mut self.mirror.cells[cell - 1]).write_complete(echo);
        self.emit_cell_updated(cell);
        Ok(())
    }

    fn modify_controller_parameter<T: Copy>(
        &mut self,
        value: T,
        parameter: fn(&mut ControllerState) -> &mut Parameter<T>,
        write: fn(&mut Device, T) -> Result<T, DeviceError>,
    ) -> Result<(), DeviceError> {
        debug!(
            "Starting controller parameter modification on {}",
            self.mirror.address.name
        );
        parameter(&mut self.mirror.controller).write_start(value);
        self.emit_controller_updated();

        let echo = write(&mut self.device, value)?;
        debug!(
            "Completing controller parameter modification on {}",
            self.mirror.address.name
        );
        parameter(&mut self.mirror.controller).write_complete(echo);
        self.emit_controller_updated();
        Ok(())
    }

    fn apply_profile(&mut self, settings: Vec<Option<CellSettings>>) -> Result<(), DeviceError> {
        // Record intent for every cell first, then run the write jobs in
        // cell order. Cells missing from the profile are disabled.
        for (i, cell_settings) in settings.iter().enumerate() {
            let cell = i + 1;
            match cell_settings {
                Some(s) => self.mirror.cells[i].start_settings(s),
                None => self.mirror.cells[i].enabled.write_start(false),
            }
            self.emit_cell_updated(cell);
        }
        for (i, cell_settings) in settings.iter().enumerate() {
            let cell = i + 1;
            match cell_settings {
                Some(s) => {
                    let echoes = match self.write_settings_guarded(cell, s)? {
                        Some(echoes) => echoes,
                        None => continue,
                    };
                    self.mirror.cells[i].complete_settings(&echoes);
                }
                None => {
                    let echo = match self.disable_cell_guarded(cell)? {
                        Some(echo) => echo,
                        None => continue,
                    };
                    self.mirror.cells[i].enabled.write_complete(echo);
                }
            }
            self.emit_cell_updated(cell);
        }
        Ok(())
    }

    /// Distinguishes fatal errors (propagated) from per-cell failures
    /// (logged; the cell's pending counts stay raised until a poll-less
    /// write resolves them, which the fault evaluator shows as a warning).
    fn write_settings_guarded(
        &mut self,
        cell: usize,
        settings: &CellSettings,
    ) -> Result<Option<CellSettings>, DeviceError> {
        match mirror::write_cell_settings(&mut self.device, cell, settings) {
            Ok(echoes) => Ok(Some(echoes)),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                error!("{}[{}]: profile apply failed: {}", self.mirror.address.name, cell, e);
                Ok(None)
            }
        }
    }

    fn disable_cell_guarded(&mut self, cell: usize) -> Result<Option<bool>, DeviceError> {
        match self.device.set_cell_enabled(cell, false) {
            Ok(echo) => Ok(Some(echo)),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                error!("{}[{}]: disabling cell failed: {}", self.mirror.address.name, cell, e);
                Ok(None)
            }
        }
    }

    /// One polling pass: read every mutable register, reconcile the mirror,
    /// emit per-cell events in index order and one batch event at the end.
    fn poll(&mut self) -> Result<(), DeviceError> {
        debug!("Start reading values from {}", self.mirror.address);
        let (controller_updates, cell_updates) = mirror::read_device_updates(&mut self.device)?;
        debug!("Completed reading values from {}", self.mirror.address);
        self.mirror.controller.apply_updates(&controller_updates);
        self.emit_controller_updated();
        for (i, updates) in cell_updates.iter().enumerate() {
            self.mirror.cells[i].apply_updates(updates);
            self.emit_cell_updated(i + 1);
        }
        self.emit(EventKind::Updated);
        Ok(())
    }

    fn connection_lost(&mut self, error: DeviceError) {
        self.shut.store(true, Ordering::Release);
        let message = format!("{}: Connection error: {}", self.mirror.address, error);
        error!("{}", message);
        self.emit(EventKind::StateChanged(LifecycleState::ConnectionLost));
        self.emit(EventKind::ConnectionError { message });
        // Dropping the worker closes the socket and discards queued
        // commands; their senders observe Cancelled.
    }

    fn shutdown(&mut self) {
        self.shut.store(true, Ordering::Release);
        debug!("Shutting down supervisor for {}", self.mirror.address);
    }
}
