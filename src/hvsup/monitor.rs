// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-device fault grades derived from supervisor events.
//!
//! The monitor keeps a shadow of every device's last published state and
//! refreshes one `Observable<ErrorGrade>` per device whenever a cell or
//! controller update arrives. Subscribers run synchronously on the event
//! loop.

use std::collections::BTreeMap;
use std::collections::HashMap;

use devices::fault;
use devices::fault::CheckSettings;
use devices::fault::ErrorGrade;
use devices::supervisor::DeviceEvent;
use devices::supervisor::EventKind;
use devices::CellState;
use devices::ControllerState;
use observable::Observable;

pub struct FleetMonitor {
    check: CheckSettings,
    devices: HashMap<String, DeviceMonitor>,
}

struct DeviceMonitor {
    cells: BTreeMap<usize, CellState>,
    controller: Option<ControllerState>,
    grade: Observable<ErrorGrade>,
}

impl DeviceMonitor {
    fn new() -> DeviceMonitor {
        DeviceMonitor {
            cells: BTreeMap::new(),
            controller: None,
            grade: Observable::new(ErrorGrade::Ok),
        }
    }

    fn refresh(&mut self, check: &CheckSettings) {
        let grade = match &self.controller {
            Some(controller) => fault::check_device(controller, self.cells.values(), check),
            None => self
                .cells
                .values()
                .map(|cell| fault::check_cell(cell, check))
                .max()
                .unwrap_or(ErrorGrade::Ok),
        };
        self.grade.set(grade);
    }
}

impl FleetMonitor {
    pub fn new(check: CheckSettings) -> FleetMonitor {
        FleetMonitor {
            check,
            devices: HashMap::new(),
        }
    }

    /// Registers a device and hands out its grade observable for
    /// subscription.
    pub fn register_device(&mut self, name: &str) -> &mut Observable<ErrorGrade> {
        &mut self
            .devices
            .entry(name.to_string())
            .or_insert_with(DeviceMonitor::new)
            .grade
    }

    pub fn grade(&self, name: &str) -> Option<ErrorGrade> {
        self.devices.get(name).map(|device| *device.grade.get())
    }

    pub fn handle_event(&mut self, event: &DeviceEvent) {
        let device = match self.devices.get_mut(&event.device.name) {
            Some(device) => device,
            None => return,
        };
        match &event.kind {
            EventKind::CellUpdated { cell_index, state } => {
                device.cells.insert(*cell_index, state.clone());
                device.refresh(&self.check);
            }
            EventKind::ControllerUpdated { state } => {
                device.controller = Some(state.clone());
                device.refresh(&self.check);
            }
            EventKind::StateChanged(_) | EventKind::Updated | EventKind::ConnectionError { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use devices::Parameter;
    use hv_protocol::CellCsr;
    use hv_protocol::ControllerStatus;
    use hv_protocol::TemperatureSensor;

    use super::*;

    fn address() -> devices::DeviceAddress {
        devices::DeviceAddress {
            name: "psA".to_string(),
            host: "10.0.0.1".to_string(),
            port: 5000,
        }
    }

    fn cell_state(cell_index: usize) -> CellState {
        CellState {
            enabled: Parameter::new(false),
            voltage_set: Parameter::new(0.0),
            current_limit: Parameter::new(50.0),
            ramp_up_speed: Parameter::new(1),
            ramp_down_speed: Parameter::new(1),
            voltage_measured: 0.0,
            current_measured: 0.0,
            csr: CellCsr::empty(),
            cell_index,
            counter_number: String::new(),
            auto_enable: false,
            voltage_range: (0.0, 3000.0),
            current_limit_range: (0.0, 100.0),
            measured_voltage_range: (0.0, 1000.0),
            measured_current_range: (0.0, 100.0),
        }
    }

    fn controller_state() -> ControllerState {
        ControllerState {
            base_voltage_enabled: Parameter::new(true),
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
        }
    }

    fn cell_event(cell_index: usize, state: CellState) -> DeviceEvent {
        DeviceEvent {
            device: address(),
            kind: EventKind::CellUpdated { cell_index, state },
        }
    }

    #[test]
    fn grade_follows_the_worst_cell() {
        let mut monitor = FleetMonitor::new(CheckSettings::default());
        monitor.register_device("psA");

        monitor.handle_event(&cell_event(1, cell_state(1)));
        assert_eq!(monitor.grade("psA"), Some(ErrorGrade::Ok));

        let mut sick = cell_state(2);
        sick.csr = CellCsr::HARDWARE_FAILURE;
        monitor.handle_event(&cell_event(2, sick));
        assert_eq!(monitor.grade("psA"), Some(ErrorGrade::Error));

        // The sick cell recovers; the grade relaxes with it.
        monitor.handle_event(&cell_event(2, cell_state(2)));
        assert_eq!(monitor.grade("psA"), Some(ErrorGrade::Ok));
    }

    #[test]
    fn controller_status_feeds_the_grade() {
        let mut monitor = FleetMonitor::new(CheckSettings::default());
        monitor.register_device("psA");
        let mut controller = controller_state();
        controller.status = ControllerStatus::TEMPERATURE_PROTECTION;
        monitor.handle_event(&DeviceEvent {
            device: address(),
            kind: EventKind::ControllerUpdated { state: controller },
        });
        assert_eq!(monitor.grade("psA"), Some(ErrorGrade::Error));
    }

    #[test]
    fn observers_fire_on_every_refresh() {
        let mut monitor = FleetMonitor::new(CheckSettings::default());
        let fired = Rc::new(Cell::new(0));
        let observed = fired.clone();
        monitor
            .register_device("psA")
            .subscribe(move |_| observed.set(observed.get() + 1));

        monitor.handle_event(&cell_event(1, cell_state(1)));
        monitor.handle_event(&cell_event(1, cell_state(1)));
        assert_eq!(fired.get(), 2);
    }

    #[test]
    fn events_for_unknown_devices_are_ignored() {
        let mut monitor = FleetMonitor::new(CheckSettings::default());
        monitor.handle_event(&cell_event(1, cell_state(1)));
        assert_eq!(monitor.grade("psA"), None);
    }
}
