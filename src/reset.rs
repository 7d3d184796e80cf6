//! Power cycling dongles through an external program.

use std::{fmt::Display, process::Stdio};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{config::ResetSettings, error::Error};

/// What the operator asked to reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResetTarget {
    /// A registered device, by name.
    Name(String),

    /// A device path.
    Path(String),
}

impl Display for ResetTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResetTarget::Name(name) => write!(f, "device `{name}`"),
            ResetTarget::Path(path) => write!(f, "path `{path}`"),
        }
    }
}

/// Only paths within the device namespace may be handed to the reset program.
pub fn validate_path(path: &str, prefix: &str) -> Result<(), Error> {
    let bad = || Error::BadResetPath(path.to_owned());

    let suffix = path.strip_prefix(prefix).ok_or_else(bad)?;

    if suffix.is_empty()
        || suffix.contains('/')
        || path.contains("..")
        || path.chars().any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(bad());
    }

    Ok(())
}

/// Runs the configured reset program.
#[derive(Debug, Clone)]
pub struct Resetter {
    settings: ResetSettings,
}

impl Resetter {
    /// Use the program from `settings`.
    pub fn new(settings: ResetSettings) -> Self {
        Self { settings }
    }

    /// Start the reset program on `path`.
    ///
    /// The program is left to run on its own. Its outcome is logged, not returned.
    pub fn reset(&self, path: &str) -> Result<(), Error> {
        let mut child = tokio::process::Command::new(&self.settings.program)
            .args(&self.settings.args)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::ResetFailed(format!("`{}`: {e}", self.settings.program)))?;

        info!(program = %self.settings.program, %path, "Reset started");

        let path = path.to_owned();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => info!(%path, "Reset done"),
                Ok(status) => warn!(%path, %status, "Reset program failed"),
                Err(e) => warn!(%path, %e, "Reset program could not be waited on"),
            }
        });

        Ok(())
    }
}
