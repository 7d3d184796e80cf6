mod common;

use color_eyre::Result;
use common::*;
use dongle_ng::{
    config::ResetSettings,
    error::Error,
    mock::{MockModem, MockPorts},
    reset::ResetTarget,
};
use pretty_assertions::assert_eq;

fn resetting_config() -> dongle_ng::config::Config {
    let mut config = fast_config();
    config.reset = ResetSettings {
        program: "true".into(),
        args: vec![],
    };

    config
}

#[tokio::test]
async fn reset_by_name_takes_device_out_of_service() -> Result<()> {
    let modem = MockModem::new(IMEI);
    let ports = MockPorts::new().with("/dev/ttyUSB0", modem.clone());

    let control_center = control_center_with_config(resetting_config(), &ports)?;
    control_center.scan().await;

    let path = control_center
        .reset(ResetTarget::Name("dongle0".into()))
        .await?;
    assert_eq!(path, "/dev/ttyUSB0");

    settle().await;
    assert!(control_center.devices().is_empty());
    assert!(!modem.is_connected());

    // Back after the next scan.
    control_center.scan().await;
    assert_eq!(control_center.devices().len(), 1);

    control_center.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn reset_by_path() -> Result<()> {
    let ports = MockPorts::new().with("/dev/ttyUSB0", MockModem::new(IMEI));

    let control_center = control_center_with_config(resetting_config(), &ports)?;
    control_center.scan().await;

    // Nothing registered there, still fine.
    let path = control_center
        .reset(ResetTarget::Path("/dev/ttyUSB7".into()))
        .await?;
    assert_eq!(path, "/dev/ttyUSB7");
    assert_eq!(control_center.devices().len(), 1);

    control_center
        .reset(ResetTarget::Path("/dev/ttyUSB0".into()))
        .await?;
    assert!(control_center.devices().is_empty());

    Ok(())
}

#[tokio::test]
async fn reset_outside_device_namespace_is_refused() -> Result<()> {
    let ports = MockPorts::new().with("/dev/ttyUSB0", MockModem::new(IMEI));

    let control_center = control_center_with_config(resetting_config(), &ports)?;
    control_center.scan().await;

    for path in ["/dev/sda", "/dev/ttyUSB0/../../sda", "/dev/ttyUSB"] {
        let result = control_center.reset(ResetTarget::Path(path.into())).await;
        assert!(matches!(result, Err(Error::BadResetPath(_))));
    }

    let result = control_center
        .reset(ResetTarget::Name("unknown".into()))
        .await;
    assert!(matches!(result, Err(Error::NotFound(_))));

    assert_eq!(control_center.devices().len(), 1);

    control_center.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn reset_program_missing() -> Result<()> {
    let ports = MockPorts::new();

    let mut config = fast_config();
    config.reset.program = "/nonexistent/usbreset".into();

    let control_center = control_center_with_config(config, &ports)?;

    let result = control_center
        .reset(ResetTarget::Path("/dev/ttyUSB0".into()))
        .await;
    assert!(matches!(result, Err(Error::ResetFailed(_))));

    Ok(())
}
