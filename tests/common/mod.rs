#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use color_eyre::{eyre::eyre, Result};
use dongle_ng::{
    config::Config,
    control_center::ControlCenter,
    events::{Event, TimestampedEvent},
    mock::{MockModem, MockPorts},
};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::info;

pub const IMEI: &str = "012345678901234";
pub const OTHER_IMEI: &str = "352099001761481";

/// Timings short enough for tests.
pub fn fast_config() -> Config {
    let mut config = Config::default();

    config.discovery.settle_ms = 0;
    config.discovery.flush_quiet_ms = 10;
    config.discovery.command_timeout_ms = 300;
    config.session.poll_interval_ms = 20;
    config.session.command_timeout_ms = 300;

    config
}

pub fn control_center(ports: &MockPorts) -> Result<ControlCenter> {
    control_center_with_config(fast_config(), ports)
}

pub fn control_center_with_config(config: Config, ports: &MockPorts) -> Result<ControlCenter> {
    Ok(ControlCenter::new(config, Arc::new(ports.clone()))?)
}

/// One well behaved modem at `/dev/ttyUSB0`, scanned and in service as `dongle0`.
pub async fn one_device() -> Result<(ControlCenter, MockModem)> {
    let modem = MockModem::new(IMEI);
    let ports = MockPorts::new().with("/dev/ttyUSB0", modem.clone());

    let control_center = control_center(&ports)?;
    let report = control_center.scan().await;
    assert_eq!(report.found.len(), 1);

    info!("Device in service");

    Ok((control_center, modem))
}

pub async fn next_event(rx: &mut broadcast::Receiver<TimestampedEvent>) -> Result<Event> {
    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await??;

    Ok(event.inner)
}

/// Give in-flight traffic time to be handled, then check nothing was published.
pub async fn assert_no_event(rx: &mut broadcast::Receiver<TimestampedEvent>) {
    settle().await;

    match rx.try_recv() {
        Err(TryRecvError::Empty) => {}
        other => panic!("Expected no event, got {other:?}"),
    }
}

pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

/// Wait until the modem has seen `command`.
pub async fn wait_for_command(modem: &MockModem, command: &str) -> Result<()> {
    for _ in 0..200 {
        if modem.received().iter().any(|received| received == command) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    Err(eyre!(
        "Modem never got `{command}`, only {:?}",
        modem.received()
    ))
}
