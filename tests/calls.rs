mod common;

use color_eyre::Result;
use common::*;
use dongle_ng::{
    call::{CallPhase, DeviceState, FailureCause},
    error::Error,
    events::Event,
};
use pretty_assertions::assert_eq;

#[tokio::test]
async fn dial_then_no_carrier_fails_once() -> Result<()> {
    let (control_center, modem) = one_device().await?;
    let mut events = control_center.events().subscribe();

    let call = control_center.dial("dongle0", "12345").await?;
    assert_eq!(call.number, "12345");
    assert_eq!(call.phase, CallPhase::Dialing);

    let device = control_center.device("dongle0")?;
    assert_eq!(device.state(), DeviceState::Active);
    assert_eq!(device.call().map(|c| c.id), Some(call.id));

    wait_for_command(&modem, "ATD12345;").await?;

    // The `OK` to the dial command belongs to it, nobody hears about it.
    assert_no_event(&mut events).await;

    modem.inject("\r\nNO CARRIER\r\n");

    assert_eq!(
        next_event(&mut events).await?,
        Event::CallFailed {
            device: "dongle0".into(),
            call: call.id,
            cause: FailureCause::NoAnswer
        }
    );
    assert_eq!(device.state(), DeviceState::Ready);
    assert_eq!(device.call(), None);

    // A second report of the same thing changes nothing.
    modem.inject("\r\nNO CARRIER\r\n");
    assert_no_event(&mut events).await;
    assert_eq!(device.state(), DeviceState::Ready);

    control_center.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn busy_far_end() -> Result<()> {
    let (control_center, modem) = one_device().await?;
    let mut events = control_center.events().subscribe();

    let call = control_center.dial_string("dongle0/555").await?;
    wait_for_command(&modem, "ATD555;").await?;

    modem.inject("\r\nBUSY\r\n");

    assert_eq!(
        next_event(&mut events).await?,
        Event::CallFailed {
            device: "dongle0".into(),
            call: call.id,
            cause: FailureCause::Busy
        }
    );
    assert_eq!(control_center.device("dongle0")?.state(), DeviceState::Ready);

    control_center.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn answered_then_hung_up() -> Result<()> {
    let (control_center, modem) = one_device().await?;
    let mut events = control_center.events().subscribe();

    let call = control_center.dial("dongle0", "12345").await?;
    wait_for_command(&modem, "ATD12345;").await?;

    modem.inject("\r\nCONNECT\r\n");

    assert_eq!(
        next_event(&mut events).await?,
        Event::Answered {
            device: "dongle0".into(),
            call: call.id
        }
    );

    let device = control_center.device("dongle0")?;
    assert_eq!(device.state(), DeviceState::Active);
    assert_eq!(device.call().map(|c| c.phase), Some(CallPhase::Answered));

    let hung_up = control_center.hangup("dongle0").await?;
    assert_eq!(hung_up.id, call.id);
    assert_eq!(device.state(), DeviceState::Ready);

    wait_for_command(&modem, "ATH").await?;

    // A local hangup is not a failure.
    assert_no_event(&mut events).await;

    control_center.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn hangup_confirmation_after_release_is_harmless() -> Result<()> {
    let (control_center, modem) = one_device().await?;
    let mut events = control_center.events().subscribe();

    control_center.dial("dongle0", "12345").await?;
    wait_for_command(&modem, "ATD12345;").await?;
    settle().await;

    control_center.hangup("dongle0").await?;
    wait_for_command(&modem, "ATH").await?;

    // Some firmware reports the call ending after `ATH`.
    modem.inject("\r\nNO CARRIER\r\n");

    assert_no_event(&mut events).await;
    assert_eq!(control_center.device("dongle0")?.state(), DeviceState::Ready);

    control_center.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn only_one_call_per_device() -> Result<()> {
    let (control_center, _modem) = one_device().await?;

    control_center.dial("dongle0", "12345").await?;

    let second = control_center.dial("dongle0", "555").await;
    assert!(matches!(second, Err(Error::Busy(_))));

    let device = control_center.device("dongle0")?;
    assert_eq!(device.call().map(|c| c.number), Some("12345".to_owned()));

    control_center.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn hangup_without_call_is_not_found() -> Result<()> {
    let (control_center, modem) = one_device().await?;
    let sent = modem.received().len();

    let result = control_center.hangup("dongle0").await;
    assert!(matches!(result, Err(Error::NotFound(_))));

    let result = control_center.hangup("dongle0").await;
    assert!(matches!(result, Err(Error::NotFound(_))));

    assert_eq!(control_center.device("dongle0")?.state(), DeviceState::Ready);
    assert_eq!(modem.received().len(), sent);

    control_center.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn bad_requests_never_reach_the_wire() -> Result<()> {
    let (control_center, modem) = one_device().await?;
    let sent = modem.received().len();

    let result = control_center.dial("unknown", "555").await;
    assert!(matches!(result, Err(Error::NotFound(_))));

    let result = control_center.hangup("unknown").await;
    assert!(matches!(result, Err(Error::NotFound(_))));

    let result = control_center.dial("dongle0", "555;+CFUN=0").await;
    assert!(matches!(result, Err(Error::BadDialString(_))));

    for bad in ["dongle0", "/555", "dongle0/"] {
        let result = control_center.dial_string(bad).await;
        assert!(matches!(result, Err(Error::BadDialString(_))));
    }

    settle().await;
    assert_eq!(modem.received().len(), sent);
    assert_eq!(control_center.device("dongle0")?.state(), DeviceState::Ready);

    control_center.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn transport_fault_fails_call_and_device() -> Result<()> {
    let (control_center, modem) = one_device().await?;
    let mut events = control_center.events().subscribe();

    let call = control_center.dial("dongle0", "12345").await?;
    wait_for_command(&modem, "ATD12345;").await?;

    modem.disconnect();

    assert_eq!(
        next_event(&mut events).await?,
        Event::CallFailed {
            device: "dongle0".into(),
            call: call.id,
            cause: FailureCause::Error
        }
    );
    assert!(matches!(
        next_event(&mut events).await?,
        Event::DeviceFault { device, .. } if device == "dongle0"
    ));

    let device = control_center.device("dongle0")?;
    assert_eq!(device.state(), DeviceState::Error);
    assert_eq!(device.call(), None);

    // No way out but a reset.
    let result = control_center.dial("dongle0", "12345").await;
    assert!(matches!(result, Err(Error::Busy(_))));

    control_center.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn other_urcs_are_surfaced_without_state_change() -> Result<()> {
    let (control_center, modem) = one_device().await?;
    let mut events = control_center.events().subscribe();

    modem.inject("\r\nRING\r\n\r\n+CLIP: \"+4712345678\",145\r\n");

    assert_eq!(
        next_event(&mut events).await?,
        Event::Unsolicited {
            device: "dongle0".into(),
            line: "RING".into()
        }
    );
    assert!(matches!(
        next_event(&mut events).await?,
        Event::Unsolicited { line, .. } if line.starts_with("+CLIP")
    ));

    assert_eq!(control_center.device("dongle0")?.state(), DeviceState::Ready);
    assert_eq!(control_center.events().recent().len(), 2);

    control_center.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn commands_get_replies_while_in_service() -> Result<()> {
    let (control_center, modem) = one_device().await?;
    modem.clone().reply("AT+CSQ", "\r\n+CSQ: 20,99\r\n\r\nOK\r\n");

    let device = control_center.device("dongle0")?;

    let reply = device.query("AT+CSQ").await?;
    assert!(reply.is_ok());
    assert!(reply.text.contains("+CSQ: 20,99"));

    let reply = device.query("AT+NOPE").await?;
    assert!(!reply.is_ok());

    assert_eq!(device.state(), DeviceState::Ready);

    control_center.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn hangup_goes_out_while_a_query_waits() -> Result<()> {
    let (control_center, modem) = one_device().await?;
    modem.clone().silent("AT+CSQ");

    let call = control_center.dial("dongle0", "12345").await?;
    wait_for_command(&modem, "ATD12345;").await?;
    settle().await;

    let device = control_center.device("dongle0")?;
    let query = tokio::spawn({
        let device = device.clone();
        async move { device.query("AT+CSQ").await }
    });
    wait_for_command(&modem, "AT+CSQ").await?;

    let hung_up = control_center.hangup("dongle0").await?;
    assert_eq!(hung_up.id, call.id);

    wait_for_command(&modem, "ATH").await?;
    assert_eq!(device.state(), DeviceState::Ready);
    assert_eq!(device.call(), None);

    // Whatever the query got, the device carries on.
    let _ = query.await?;
    assert_eq!(device.state(), DeviceState::Ready);

    control_center.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn transport_fault_is_reported_once() -> Result<()> {
    let (control_center, modem) = one_device().await?;
    modem.clone().silent("AT+CSQ");
    let mut events = control_center.events().subscribe();

    let device = control_center.device("dongle0")?;
    let query = tokio::spawn({
        let device = device.clone();
        async move { device.query("AT+CSQ").await }
    });
    wait_for_command(&modem, "AT+CSQ").await?;

    modem.disconnect();

    let result = query.await?;
    assert!(matches!(result, Err(Error::IoFailure(_))));

    assert!(matches!(
        next_event(&mut events).await?,
        Event::DeviceFault { device, .. } if device == "dongle0"
    ));
    assert_no_event(&mut events).await;
    assert_eq!(device.state(), DeviceState::Error);

    control_center.shutdown().await;

    Ok(())
}
