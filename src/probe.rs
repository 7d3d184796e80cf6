//! Finding out which ports are modems, and which modems they are.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    command::{CommandRequest, Reply},
    config::Discovery,
    device::Imei,
    error::Error,
    serial::{PortOpener, Transport},
    session::exchange,
};

/// Timing of the probe handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSettings {
    /// Wait this long after opening.
    pub settle: Duration,

    /// Blind `AT`s sent before the handshake.
    pub wakeup_commands: usize,

    /// Quiet period ending a flush.
    pub flush_quiet: Duration,

    /// Deadline per handshake step.
    pub command_timeout: Duration,
}

impl From<&Discovery> for ProbeSettings {
    fn from(discovery: &Discovery) -> Self {
        Self {
            settle: Duration::from_millis(discovery.settle_ms),
            wakeup_commands: discovery.wakeup_commands,
            flush_quiet: Duration::from_millis(discovery.flush_quiet_ms),
            command_timeout: Duration::from_millis(discovery.command_timeout_ms),
        }
    }
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self::from(&Discovery::default())
    }
}

/// The first line which is an IMEI.
pub fn extract_imei(text: &str) -> Option<Imei> {
    text.lines().find_map(Imei::parse)
}

/// Run one handshake step, which must end in success.
async fn step(transport: &mut Transport, request: CommandRequest) -> Result<Reply, String> {
    match exchange(transport, &request).await {
        Ok(reply) if reply.is_ok() => {
            debug!(%request, "Step done");
            Ok(reply)
        }
        Ok(reply) => Err(format!("`{request}` failed: {:?}", reply.text.trim())),
        Err(e) => Err(format!("`{request}`: {e}")),
    }
}

async fn handshake(transport: &mut Transport, settings: &ProbeSettings) -> Result<Imei, String> {
    tokio::time::sleep(settings.settle).await;

    // Freshly attached modems tend to miss the first command.
    for _ in 0..settings.wakeup_commands {
        let wake_up = CommandRequest::wake_up(settings.command_timeout);
        transport
            .write_line(&wake_up.text)
            .await
            .map_err(|e| format!("wake-up: {e}"))?;

        tokio::time::sleep(settings.flush_quiet).await;
    }

    transport
        .discard_input(settings.flush_quiet)
        .await
        .map_err(|e| format!("flush: {e}"))?;

    step(transport, CommandRequest::echo_off(settings.command_timeout)).await?;
    step(transport, CommandRequest::liveness(settings.command_timeout)).await?;
    let identity = step(transport, CommandRequest::identity(settings.command_timeout)).await?;

    extract_imei(&identity.text)
        .ok_or_else(|| format!("no IMEI in identity reply {:?}", identity.text.trim()))
}

async fn probe_port(
    opener: &dyn PortOpener,
    path: &str,
    settings: &ProbeSettings,
) -> Result<Imei, Error> {
    let mut transport = opener.open(path).await?;

    let result = handshake(&mut transport, settings).await;
    transport.close().await;

    match result {
        Ok(imei) => {
            info!(%imei, "Modem found");
            Ok(imei)
        }
        Err(reason) => {
            debug!(%reason, "Not a modem");
            Err(Error::NotAModem {
                path: path.to_owned(),
                reason,
            })
        }
    }
}

/// Open `path`, run the handshake, close it again.
///
/// The transport is closed whatever the outcome.
pub async fn probe(
    opener: &dyn PortOpener,
    path: &str,
    settings: &ProbeSettings,
) -> Result<Imei, Error> {
    probe_port(opener, path, settings)
        .instrument(info_span!("probe", %path))
        .await
}

/// A port which passed the probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Probed {
    /// Where.
    pub path: String,

    /// Which modem.
    pub imei: Imei,
}

/// A port which did not pass the probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeFailure {
    /// Where.
    pub path: String,

    /// Why.
    pub error: Error,
}

/// The outcome of probing a set of ports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    /// One port per modem, the first one found.
    pub found: Vec<Probed>,

    /// Further ports of modems already found.
    pub duplicates: Vec<Probed>,

    /// Ports which are not modems, or could not be opened.
    pub failures: Vec<ProbeFailure>,
}

/// Probe each of `paths` in turn.
///
/// A port failing never stops the scan.
/// When several ports report the same IMEI, the first one is kept.
pub async fn scan(opener: &dyn PortOpener, paths: &[String], settings: &ProbeSettings) -> ScanReport {
    let mut report = ScanReport::default();

    for path in paths {
        match probe(opener, path, settings).await {
            Ok(imei) => {
                let probed = Probed {
                    path: path.clone(),
                    imei,
                };

                if let Some(first) = report.found.iter().find(|p| p.imei == probed.imei) {
                    warn!(%path, imei = %probed.imei, first = %first.path, "Another port of a known modem, skipping");
                    report.duplicates.push(probed);
                } else {
                    report.found.push(probed);
                }
            }
            Err(error) => {
                debug!(%path, %error, "Probe failed");
                report.failures.push(ProbeFailure {
                    path: path.clone(),
                    error,
                });
            }
        }
    }

    info!(
        found = report.found.len(),
        duplicates = report.duplicates.len(),
        failures = report.failures.len(),
        "Scan done"
    );

    report
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::mock::{MockModem, MockPorts};

    fn fast() -> ProbeSettings {
        ProbeSettings {
            settle: Duration::ZERO,
            wakeup_commands: 2,
            flush_quiet: Duration::from_millis(10),
            command_timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn imei_is_first_long_digit_line() {
        assert_eq!(
            extract_imei("AT+CGSN\r\r\n  012345678901234 \r\n\r\nOK\r\n")
                .unwrap()
                .as_str(),
            "012345678901234"
        );
        assert_eq!(
            extract_imei("1234\n98765432109876\n012345678901234\nOK").unwrap().as_str(),
            "98765432109876"
        );
        assert!(extract_imei("+CGSN: 0123456789012345\r\nOK\r\n").is_none());
        assert!(extract_imei("\r\nOK\r\n").is_none());
    }

    #[tokio::test]
    async fn probe_finds_imei() {
        let ports = MockPorts::new().with("/dev/ttyUSB0", MockModem::new("012345678901234"));

        let imei = probe(&ports, "/dev/ttyUSB0", &fast()).await.unwrap();
        assert_eq!(imei.as_str(), "012345678901234");
    }

    #[tokio::test]
    async fn probe_survives_echo_and_banner() {
        let modem = MockModem::new("012345678901234")
            .echo(true)
            .banner("\r\n^BOOT:12345,0,0,0,6\r\n");
        let ports = MockPorts::new().with("/dev/ttyUSB0", modem.clone());

        let imei = probe(&ports, "/dev/ttyUSB0", &fast()).await.unwrap();
        assert_eq!(imei.as_str(), "012345678901234");

        let received = modem.received();
        assert_eq!(&received[..2], &["AT".to_owned(), "AT".to_owned()]);
        assert_eq!(
            &received[2..],
            &["ATE0".to_owned(), "AT".to_owned(), "AT+CGSN".to_owned()]
        );
    }

    #[tokio::test]
    async fn error_reply_is_not_a_modem() {
        let ports = MockPorts::new().with(
            "/dev/ttyUSB0",
            MockModem::new("012345678901234").reply("AT+CGSN", "\r\nERROR\r\n\r\nOK\r\n"),
        );

        let result = probe(&ports, "/dev/ttyUSB0", &fast()).await;
        assert!(matches!(result, Err(Error::NotAModem { .. })));
    }

    #[tokio::test]
    async fn silence_is_not_a_modem() {
        let modem = MockModem::unresponsive();
        let ports = MockPorts::new().with("/dev/ttyUSB0", modem.clone());

        let result = probe(&ports, "/dev/ttyUSB0", &fast()).await;
        assert!(matches!(result, Err(Error::NotAModem { .. })));

        // Gave up at the first handshake step.
        assert_eq!(modem.received().last().unwrap(), "ATE0");
    }

    #[tokio::test]
    async fn short_identity_is_not_a_modem() {
        let ports = MockPorts::new().with(
            "/dev/ttyUSB0",
            MockModem::new("012345678901234").reply("AT+CGSN", "\r\n1234567\r\n\r\nOK\r\n"),
        );

        let result = probe(&ports, "/dev/ttyUSB0", &fast()).await;
        assert!(matches!(result, Err(Error::NotAModem { .. })));
    }

    #[tokio::test]
    async fn missing_port_cannot_be_opened() {
        let ports = MockPorts::new();

        let result = probe(&ports, "/dev/ttyUSB9", &fast()).await;
        assert!(matches!(result, Err(Error::CannotOpen { .. })));
    }

    #[tokio::test]
    async fn transport_is_closed_after_probe() {
        let modem = MockModem::new("012345678901234");
        let ports = MockPorts::new().with("/dev/ttyUSB0", modem.clone());

        probe(&ports, "/dev/ttyUSB0", &fast()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!modem.is_connected());
    }

    #[tokio::test]
    async fn scan_keeps_first_port_per_imei() {
        let ports = MockPorts::new()
            .with("/dev/ttyUSB0", MockModem::new("012345678901234"))
            .with("/dev/ttyUSB1", MockModem::new("012345678901234"))
            .with("/dev/ttyUSB2", MockModem::unresponsive())
            .with("/dev/ttyUSB3", MockModem::new("999999999999999"));

        let paths = ports.candidates("/dev/ttyUSB");
        let report = scan(&ports, &paths, &fast()).await;

        let found = report
            .found
            .iter()
            .map(|p| p.path.as_str())
            .collect::<Vec<_>>();
        assert_eq!(found, vec!["/dev/ttyUSB0", "/dev/ttyUSB3"]);

        assert_eq!(report.duplicates.len(), 1);
        assert_eq!(report.duplicates[0].path, "/dev/ttyUSB1");

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, "/dev/ttyUSB2");
    }
}
