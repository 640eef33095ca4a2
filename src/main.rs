// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Supervises a fleet of multichannel high-voltage source boards.

use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use anyhow::Context;
use devices::fault::ErrorGrade;
use devices::supervisor;
use devices::supervisor::DeviceEvent;
use devices::supervisor::EventKind;
use devices::supervisor::SupervisorOptions;
use log::error;
use log::info;
use log::warn;

mod hvsup;
use hvsup::cmdline::Args;
use hvsup::config::Config;
use hvsup::data_logger::DataLogger;
use hvsup::files;
use hvsup::monitor::FleetMonitor;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigint(_: libc::c_int) {
    INTERRUPTED.store(true, Ordering::Release);
}

fn install_interrupt_handler() {
    let handler = handle_sigint as extern "C" fn(libc::c_int);
    // Safe because the handler only touches an atomic flag.
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args: Args = argh::from_env();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    install_interrupt_handler();

    let config = match &args.cfg {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    let devices = files::read_device_list(&args.devices)
        .with_context(|| format!("failed to read device list {}", args.devices.display()))?;
    let profile = match &args.profile {
        Some(path) => Some(
            files::read_profile(path)
                .with_context(|| format!("failed to read profile {}", path.display()))?,
        ),
        None => None,
    };
    if let Some(profile) = &profile {
        info!("Loaded profile {}", profile.source().display());
    }
    let data_logger = DataLogger::new(&config.program.data_log_file).with_context(|| {
        format!(
            "failed to open value log {}",
            config.program.data_log_file.display()
        )
    })?;

    info!(
        "{}: supervising {} devices",
        config.gui.window_title,
        devices.len()
    );

    let (events_tx, events) = mpsc::channel::<DeviceEvent>();
    let options = SupervisorOptions {
        defaults: config.defaults.clone(),
        ..Default::default()
    };
    let pending: Vec<_> = devices
        .into_iter()
        .map(|device| supervisor::connect(device, options.clone(), events_tx.clone()))
        .collect();
    // The worker threads hold the remaining senders; once every supervisor
    // is gone the event loop sees the channel disconnect.
    drop(events_tx);

    let mut monitor = FleetMonitor::new(config.check);
    let mut handles = Vec::new();
    for connection in pending {
        let name = connection.address().name.clone();
        match connection.wait() {
            Ok(handle) => {
                let label = name.clone();
                let mut last = ErrorGrade::Ok;
                monitor.register_device(&name).subscribe(move |grade| {
                    if *grade != last {
                        last = *grade;
                        info!("{}: status changed to {}", label, grade);
                    }
                });
                if let Some(profile) = &profile {
                    if let Err(e) = handle.apply_device_profile(&profile.device(&name)) {
                        error!("{}: failed to apply profile: {}", name, e);
                    }
                }
                handles.push(handle);
            }
            Err(e) => error!("{}", e),
        }
    }

    loop {
        if INTERRUPTED.load(Ordering::Acquire) {
            warn!("Process interrupted");
            break;
        }
        match events.recv_timeout(Duration::from_millis(250)) {
            Ok(event) => {
                handle_event(&event, &data_logger);
                monitor.handle_event(&event);
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                info!("All supervisors have exited");
                break;
            }
        }
    }

    for handle in &handles {
        handle.close();
    }
    Ok(())
}

fn handle_event(event: &DeviceEvent, data_logger: &DataLogger) {
    match &event.kind {
        EventKind::StateChanged(state) => info!("{}: {}", event.device, state),
        EventKind::CellUpdated { cell_index, state } => {
            data_logger.cell_updated(&event.device, *cell_index, state);
        }
        EventKind::ControllerUpdated { .. } | EventKind::Updated => {}
        // The front end decides between reconnecting and disconnecting;
        // here the loss is only reported.
        EventKind::ConnectionError { message } => error!("{}", message),
    }
}
