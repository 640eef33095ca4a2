// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Blocking TCP session and typed register access for one board.
//!
//! A [`Session`] owns the socket and performs one synchronous
//! request/response exchange at a time; it is used only from the owning
//! supervisor's worker thread and is not internally synchronized. On top of
//! it, [`Device`] keeps one register cache per bank and exposes the typed
//! accessors that translate converter codes to engineering units.
//!
//! The caches exist for values that are constant for the life of a session
//! (calibration endpoints and ranges); they are dropped with the session,
//! so a reconnect always recaptures them.

use std::collections::HashMap;
use std::io;
use std::io::Read;
use std::io::Write;
use std::net::TcpStream;
use std::net::ToSocketAddrs;
use std::time::Duration;

use hv_protocol::code_to_value;
use hv_protocol::decode_response;
use hv_protocol::encode_request;
use hv_protocol::value_to_code;
use hv_protocol::CellCsr;
use hv_protocol::CellRegister;
use hv_protocol::ControllerRegister;
use hv_protocol::ControllerStatus;
use hv_protocol::Request;
use hv_protocol::Response;
use hv_protocol::TemperatureSensor;
use hv_protocol::CONTROLLER_BANK;
use hv_protocol::CURRENT_ADC_MAX;
use hv_protocol::CURRENT_DAC_MAX;
use hv_protocol::RESPONSE_LENGTH;
use hv_protocol::VOLTAGE_ADC_MAX;
use hv_protocol::VOLTAGE_DAC_MAX;
use log::warn;

use crate::DeviceAddress;
use crate::DeviceError;
use crate::OutOfRange;

fn classify_io_error(error: io::Error) -> DeviceError {
    match error.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => DeviceError::Timeout,
        io::ErrorKind::UnexpectedEof => DeviceError::PeerClosed,
        _ => DeviceError::Transport(error),
    }
}

/// One TCP connection to a board.
pub struct Session {
    stream: TcpStream,
}

impl Session {
    /// Opens a connection with the given connect and per-request timeout.
    pub fn connect(address: &DeviceAddress, timeout: Duration) -> Result<Session, DeviceError> {
        let mut addrs = (address.host.as_str(), address.port)
            .to_socket_addrs()
            .map_err(DeviceError::Transport)?;
        let addr = addrs.next().ok_or_else(|| {
            DeviceError::Transport(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "host resolved to no addresses",
            ))
        })?;
        let stream = TcpStream::connect_timeout(&addr, timeout).map_err(classify_io_error)?;
        stream
            .set_read_timeout(Some(timeout))
            .map_err(DeviceError::Transport)?;
        stream
            .set_write_timeout(Some(timeout))
            .map_err(DeviceError::Transport)?;
        // One small request line per exchange; do not let Nagle sit on it.
        stream.set_nodelay(true).map_err(DeviceError::Transport)?;
        Ok(Session { stream })
    }

    /// Sends one request and reads the fixed-length response.
    pub fn request(&mut self, request: &Request) -> Result<Response, DeviceError> {
        let line = encode_request(request);
        self.stream
            .write_all(line.as_bytes())
            .map_err(classify_io_error)?;
        let mut raw = [0u8; RESPONSE_LENGTH];
        self.stream.read_exact(&mut raw).map_err(classify_io_error)?;
        Ok(decode_response(&raw)?)
    }
}

/// Register access to one bank, with the session-constant cache.
struct RegisterBank {
    bank: u8,
    /// Display label for log messages, e.g. `psA[3]`.
    label: String,
    cache: HashMap<u8, u16>,
}

impl RegisterBank {
    fn new(bank: u8, label: String) -> RegisterBank {
        RegisterBank {
            bank,
            label,
            cache: HashMap::new(),
        }
    }

    /// Reads a register from the wire and refreshes the cache entry.
    fn read(&mut self, session: &mut Session, register: u8) -> Result<u16, DeviceError> {
        let response = session.request(&Request::read(self.bank, register))?;
        if !response.crc_ok {
            warn!("Reading register {:#04x} of {}: bad CRC", register, self.label);
        }
        self.cache.insert(register, response.data);
        Ok(response.data)
    }

    /// Writes a register and returns the device's echo. The cache stores the
    /// written value, not the echo.
    fn write(&mut self, session: &mut Session, register: u8, data: u16) -> Result<u16, DeviceError> {
        let response = session.request(&Request::write(self.bank, register, data))?;
        if !response.crc_ok {
            warn!("Writing register {:#04x} of {}: bad CRC", register, self.label);
        }
        self.cache.insert(register, data);
        Ok(response.data)
    }

    /// Returns the cached value, reading it once if not yet captured.
    fn read_cached(&mut self, session: &mut Session, register: u8) -> Result<u16, DeviceError> {
        match self.cache.get(&register) {
            Some(&value) => Ok(value),
            None => self.read(session, register),
        }
    }
}

/// One connected board: a session plus per-bank register caches and the
/// typed accessors used by the supervisor.
pub struct Device {
    address: DeviceAddress,
    session: Session,
    controller: RegisterBank,
    cells: Vec<RegisterBank>,
}

impl Device {
    pub fn connect(
        address: DeviceAddress,
        cell_count: usize,
        timeout: Duration,
    ) -> Result<Device, DeviceError> {
        let session = Session::connect(&address, timeout)?;
        let controller = RegisterBank::new(CONTROLLER_BANK, address.name.clone());
        let cells = (1..=cell_count)
            .map(|index| RegisterBank::new(index as u8, format!("{}[{}]", address.name, index)))
            .collect();
        Ok(Device {
            address,
            session,
            controller,
            cells,
        })
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    fn cell_parts(&mut self, cell: usize) -> Result<(&mut Session, &mut RegisterBank), DeviceError> {
        let count = self.cells.len();
        match cell.checked_sub(1).and_then(|i| self.cells.get_mut(i)) {
            Some(bank) => Ok((&mut self.session, bank)),
            None => Err(DeviceError::BadCellIndex { index: cell, count }),
        }
    }

    // Raw accessors. These always hit the wire (reads refresh the cache).

    pub fn controller_read(&mut self, register: ControllerRegister) -> Result<u16, DeviceError> {
        self.controller.read(&mut self.session, register.code())
    }

    pub fn controller_write(
        &mut self,
        register: ControllerRegister,
        value: u16,
    ) -> Result<u16, DeviceError> {
        self.controller.write(&mut self.session, register.code(), value)
    }

    pub fn cell_read(&mut self, cell: usize, register: CellRegister) -> Result<u16, DeviceError> {
        let (session, bank) = self.cell_parts(cell)?;
        bank.read(session, register.code())
    }

    pub fn cell_write(
        &mut self,
        cell: usize,
        register: CellRegister,
        value: u16,
    ) -> Result<u16, DeviceError> {
        let (session, bank) = self.cell_parts(cell)?;
        bank.write(session, register.code(), value)
    }

    // Session-constant cell ranges, captured through the cache.

    pub fn cell_voltage_range(&mut self, cell: usize) -> Result<(f64, f64), DeviceError> {
        let (session, bank) = self.cell_parts(cell)?;
        let low = bank.read_cached(session, CellRegister::VoltageAtZeroCode.code())?;
        let high = bank.read_cached(session, CellRegister::VoltageAtMaxCode.code())?;
        Ok((f64::from(low), f64::from(high)))
    }

    pub fn cell_current_limit_range(&mut self, cell: usize) -> Result<(f64, f64), DeviceError> {
        let (session, bank) = self.cell_parts(cell)?;
        let high = bank.read_cached(session, CellRegister::CurrentLimitMax.code())?;
        Ok((0.0, f64::from(high)))
    }

    pub fn cell_measured_voltage_range(&mut self, cell: usize) -> Result<(f64, f64), DeviceError> {
        let (session, bank) = self.cell_parts(cell)?;
        let high = bank.read_cached(session, CellRegister::VoltageMeasuredMax.code())?;
        Ok((0.0, f64::from(high)))
    }

    pub fn cell_measured_current_range(&mut self, cell: usize) -> Result<(f64, f64), DeviceError> {
        let (session, bank) = self.cell_parts(cell)?;
        let high = bank.read_cached(session, CellRegister::CurrentMeasuredMax.code())?;
        Ok((0.0, f64::from(high)))
    }

    // Typed cell accessors.

    pub fn cell_csr(&mut self, cell: usize) -> Result<CellCsr, DeviceError> {
        let raw = self.cell_read(cell, CellRegister::ControlStatus)?;
        Ok(CellCsr::from_bits_truncate(raw))
    }

    pub fn cell_enabled(&mut self, cell: usize) -> Result<bool, DeviceError> {
        Ok(self.cell_csr(cell)?.contains(CellCsr::CHANNEL_ON))
    }

    /// Switches the output through a read-modify-write of the control word.
    /// The echo's channel-on bit is the acknowledged state.
    pub fn set_cell_enabled(&mut self, cell: usize, enabled: bool) -> Result<bool, DeviceError> {
        let mut word = self.cell_read(cell, CellRegister::ControlStatus)?;
        word &= !CellCsr::CHANNEL_ON.bits();
        word |= u16::from(enabled);
        let echo = self.cell_write(cell, CellRegister::ControlStatus, word)?;
        Ok(echo & CellCsr::CHANNEL_ON.bits() != 0)
    }

    pub fn cell_output_voltage(&mut self, cell: usize) -> Result<f64, DeviceError> {
        let (low, high) = self.cell_voltage_range(cell)?;
        let code = self.cell_read(cell, CellRegister::VoltageSet)?;
        Ok(code_to_value(code, VOLTAGE_DAC_MAX, low, high)?)
    }

    pub fn set_cell_output_voltage(&mut self, cell: usize, volts: f64) -> Result<f64, DeviceError> {
        let (low, high) = self.cell_voltage_range(cell)?;
        if volts < low || volts > high {
            warn!(
                "Attempt to set voltage of {}[{}] to {} V, but allowed range is {}-{} V",
                self.address.name, cell, volts, low, high
            );
            return Err(DeviceError::OutOfRange(OutOfRange {
                cell_index: cell,
                parameter: "voltage",
                value: volts,
                low,
                high,
            }));
        }
        let code = value_to_code(volts, VOLTAGE_DAC_MAX, low, high)?;
        let echo = self.cell_write(cell, CellRegister::VoltageSet, code)?;
        Ok(code_to_value(echo, VOLTAGE_DAC_MAX, low, high)?)
    }

    pub fn cell_current_limit(&mut self, cell: usize) -> Result<f64, DeviceError> {
        let (low, high) = self.cell_current_limit_range(cell)?;
        let code = self.cell_read(cell, CellRegister::CurrentLimit)?;
        Ok(code_to_value(code, CURRENT_DAC_MAX, low, high)?)
    }

    pub fn set_cell_current_limit(&mut self, cell: usize, limit: f64) -> Result<f64, DeviceError> {
        let (low, high) = self.cell_current_limit_range(cell)?;
        if limit < low || limit > high {
            warn!(
                "Attempt to set current limit of {}[{}] to {} uA, but allowed range is {}-{} uA",
                self.address.name, cell, limit, low, high
            );
            return Err(DeviceError::OutOfRange(OutOfRange {
                cell_index: cell,
                parameter: "current limit",
                value: limit,
                low,
                high,
            }));
        }
        let code = value_to_code(limit, CURRENT_DAC_MAX, low, high)?;
        let echo = self.cell_write(cell, CellRegister::CurrentLimit, code)?;
        Ok(code_to_value(echo, CURRENT_DAC_MAX, low, high)?)
    }

    pub fn cell_measured_voltage(&mut self, cell: usize) -> Result<f64, DeviceError> {
        let (low, high) = self.cell_measured_voltage_range(cell)?;
        let code = self.cell_read(cell, CellRegister::VoltageMeasured)?;
        if code > VOLTAGE_ADC_MAX {
            warn!(
                "{}[{}]: measured voltage code {:#x} exceeds the ADC range",
                self.address.name, cell, code
            );
        }
        Ok(code_to_value(code, VOLTAGE_ADC_MAX, low, high)?)
    }

    pub fn cell_measured_current(&mut self, cell: usize) -> Result<f64, DeviceError> {
        let (low, high) = self.cell_measured_current_range(cell)?;
        let code = self.cell_read(cell, CellRegister::CurrentMeasured)?;
        if code > CURRENT_ADC_MAX {
            warn!(
                "{}[{}]: measured current code {:#x} exceeds the ADC range",
                self.address.name, cell, code
            );
        }
        Ok(code_to_value(code, CURRENT_ADC_MAX, low, high)?)
    }

    pub fn cell_ramp_up_speed(&mut self, cell: usize) -> Result<u16, DeviceError> {
        self.cell_read(cell, CellRegister::RampUpSpeed)
    }

    pub fn set_cell_ramp_up_speed(&mut self, cell: usize, speed: u16) -> Result<u16, DeviceError> {
        self.cell_write(cell, CellRegister::RampUpSpeed, speed)
    }

    pub fn cell_ramp_down_speed(&mut self, cell: usize) -> Result<u16, DeviceError> {
        self.cell_read(cell, CellRegister::RampDownSpeed)
    }

    pub fn set_cell_ramp_down_speed(&mut self, cell: usize, speed: u16) -> Result<u16, DeviceError> {
        self.cell_write(cell, CellRegister::RampDownSpeed, speed)
    }

    // Typed controller accessors.

    pub fn controller_status(&mut self) -> Result<ControllerStatus, DeviceError> {
        let raw = self.controller_read(ControllerRegister::Status)?;
        Ok(ControllerStatus::from_bits_truncate(raw))
    }

    pub fn base_voltage_enabled(&mut self) -> Result<bool, DeviceError> {
        Ok(self.controller_read(ControllerRegister::BaseVoltageOn)? != 0)
    }

    pub fn set_base_voltage_enabled(&mut self, enabled: bool) -> Result<bool, DeviceError> {
        let echo = self.controller_write(ControllerRegister::BaseVoltageOn, u16::from(enabled))?;
        Ok(echo != 0)
    }

    pub fn fan_off_temp(&mut self) -> Result<u16, DeviceError> {
        self.controller_read(ControllerRegister::FanOffTemp)
    }

    pub fn set_fan_off_temp(&mut self, value: u16) -> Result<u16, DeviceError> {
        self.controller_write(ControllerRegister::FanOffTemp, value)
    }

    pub fn fan_on_temp(&mut self) -> Result<u16, DeviceError> {
        self.controller_read(ControllerRegister::FanOnTemp)
    }

    pub fn set_fan_on_temp(&mut self, value: u16) -> Result<u16, DeviceError> {
        self.controller_write(ControllerRegister::FanOnTemp, value)
    }

    pub fn shutdown_temp(&mut self) -> Result<u16, DeviceError> {
        self.controller_read(ControllerRegister::ShutdownTemp)
    }

    pub fn set_shutdown_temp(&mut self, value: u16) -> Result<u16, DeviceError> {
        self.controller_write(ControllerRegister::ShutdownTemp, value)
    }

    fn decode_temp_sensor(&self, code: u16) -> TemperatureSensor {
        TemperatureSensor::n(code).unwrap_or_else(|| {
            warn!(
                "{}: unknown temperature sensor code {}, assuming processor sensor",
                self.address.name, code
            );
            TemperatureSensor::Processor
        })
    }

    pub fn temp_sensor(&mut self) -> Result<TemperatureSensor, DeviceError> {
        let code = self.controller_read(ControllerRegister::TempSensorSelect)?;
        Ok(self.decode_temp_sensor(code))
    }

    pub fn set_temp_sensor(
        &mut self,
        sensor: TemperatureSensor,
    ) -> Result<TemperatureSensor, DeviceError> {
        let echo = self.controller_write(ControllerRegister::TempSensorSelect, sensor.code())?;
        Ok(self.decode_temp_sensor(echo))
    }

    pub fn processor_temp(&mut self) -> Result<u16, DeviceError> {
        self.controller_read(ControllerRegister::ProcessorTemp)
    }

    pub fn board_temp(&mut self) -> Result<u16, DeviceError> {
        self.controller_read(ControllerRegister::BoardTemp)
    }

    pub fn power_supply_temp(&mut self) -> Result<u16, DeviceError> {
        self.controller_read(ControllerRegister::PowerSupplyTemp)
    }

    pub fn low_voltage(&mut self) -> Result<f64, DeviceError> {
        Ok(f64::from(self.controller_read(ControllerRegister::LowVoltage)?) / 10.0)
    }

    pub fn base_voltage(&mut self) -> Result<f64, DeviceError> {
        Ok(f64::from(self.controller_read(ControllerRegister::BaseVoltage)?) / 10.0)
    }
}

#[cfg(test)]
mod tests {
    use std::io::BufRead;
    use std::io::BufReader;
    use std::net::TcpListener;
    use std::thread;

    use hv_protocol::crc_nibble;

    use super::*;

    fn test_address(port: u16) -> DeviceAddress {
        DeviceAddress {
            name: "test".to_string(),
            host: "127.0.0.1".to_string(),
            port,
        }
    }

    /// Serves scripted responses for the raw request lines it receives.
    /// Returns the lines seen once the peer hangs up.
    fn serve_script(
        listener: TcpListener,
        responses: Vec<Option<String>>,
    ) -> thread::JoinHandle<Vec<String>> {
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut stream = stream;
            let mut seen = Vec::new();
            for response in responses {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap() == 0 {
                    break;
                }
                seen.push(line);
                match response {
                    Some(r) => stream.write_all(r.as_bytes()).unwrap(),
                    // Simulate the peer dropping the connection mid-request.
                    None => return seen,
                }
            }
            seen
        })
    }

    fn response_line(data: u16) -> String {
        let payload = format!("{:04x}", data);
        let sum = payload.bytes().map(|b| hex_value_for_test(b)).sum();
        format!("{}{:x}\n", payload, crc_nibble(sum))
    }

    fn hex_value_for_test(byte: u8) -> u32 {
        (byte as char).to_digit(16).unwrap()
    }

    #[test]
    fn read_hits_wire_and_fills_cache() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = serve_script(
            listener,
            vec![Some(response_line(0x0bb8)), Some(response_line(0x0042))],
        );

        let mut device = Device::connect(test_address(port), 2, Duration::from_secs(1)).unwrap();
        assert_eq!(
            device.cell_read(1, CellRegister::VoltageAtMaxCode).unwrap(),
            0x0bb8
        );
        // Cached now; no further wire traffic for the same register.
        let (session, bank) = device.cell_parts(1).unwrap();
        assert_eq!(
            bank.read_cached(session, CellRegister::VoltageAtMaxCode.code())
                .unwrap(),
            0x0bb8
        );
        // A different cell has its own cache and goes to the wire.
        let (session, bank) = device.cell_parts(2).unwrap();
        assert_eq!(
            bank.read_cached(session, CellRegister::VoltageAtMaxCode.code())
                .unwrap(),
            0x0042
        );
        drop(device);
        let seen = server.join().unwrap();
        assert_eq!(seen, vec!["r010b3\n", "r020b2\n"]);
    }

    #[test]
    fn write_caches_written_value_not_echo() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        // The device echoes a clamped value.
        let server = serve_script(listener, vec![Some(response_line(0x00ff))]);

        let mut device = Device::connect(test_address(port), 1, Duration::from_secs(1)).unwrap();
        let echo = device.cell_write(1, CellRegister::VoltageSet, 0x0100).unwrap();
        assert_eq!(echo, 0x00ff);
        let (session, bank) = device.cell_parts(1).unwrap();
        assert_eq!(
            bank.read_cached(session, CellRegister::VoltageSet.code()).unwrap(),
            0x0100
        );
        drop(device);
        server.join().unwrap();
    }

    #[test]
    fn bad_crc_still_returns_value() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        // CRC digit deliberately wrong.
        let server = serve_script(listener, vec![Some("002a0\n".to_string())]);

        let mut device = Device::connect(test_address(port), 1, Duration::from_secs(1)).unwrap();
        assert_eq!(device.cell_read(1, CellRegister::CellId).unwrap(), 42);
        drop(device);
        server.join().unwrap();
    }

    #[test]
    fn malformed_response_fails_decode() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = serve_script(listener, vec![Some("00zz3\n".to_string())]);

        let mut device = Device::connect(test_address(port), 1, Duration::from_secs(1)).unwrap();
        assert!(matches!(
            device.cell_read(1, CellRegister::CellId),
            Err(DeviceError::MalformedResponse(_))
        ));
        drop(device);
        server.join().unwrap();
    }

    #[test]
    fn peer_close_is_classified() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = serve_script(listener, vec![None]);

        let mut device = Device::connect(test_address(port), 1, Duration::from_secs(1)).unwrap();
        assert!(matches!(
            device.cell_read(1, CellRegister::CellId),
            Err(DeviceError::PeerClosed)
        ));
        drop(device);
        server.join().unwrap();
    }

    #[test]
    fn request_timeout_is_classified() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accept but never respond.
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(500));
            drop(stream);
        });

        let mut device =
            Device::connect(test_address(port), 1, Duration::from_millis(100)).unwrap();
        assert!(matches!(
            device.cell_read(1, CellRegister::CellId),
            Err(DeviceError::Timeout)
        ));
        drop(device);
        server.join().unwrap();
    }

    #[test]
    fn bad_cell_index() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut device = Device::connect(test_address(port), 4, Duration::from_secs(1)).unwrap();
        assert!(matches!(
            device.cell_read(0, CellRegister::CellId),
            Err(DeviceError::BadCellIndex { index: 0, count: 4 })
        ));
        assert!(matches!(
            device.cell_read(5, CellRegister::CellId),
            Err(DeviceError::BadCellIndex { index: 5, count: 4 })
        ));
    }
}
