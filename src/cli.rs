use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::Level;

/// The command line interface for dongle-ng.
#[derive(Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to a configuration file
    pub config: Option<PathBuf>,

    /// Log level on stdout
    #[arg(long, default_value_t = Level::INFO)]
    pub log_level: Level,

    /// Also log to a daily rolling file in this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Subcommands
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Commands available in the command line interface.
#[derive(Subcommand)]
pub enum Commands {
    /// Examples for user convenience.
    #[clap(subcommand)]
    Examples(Examples),

    /// Probe for modems, print what was found, and exit.
    Scan,

    /// Place a call, print what happens, hang up.
    Dial {
        /// `<device>/<number>`
        dial_string: String,

        /// Seconds to stay on the call before hanging up.
        #[arg(long, default_value_t = 10)]
        hold: u64,
    },

    /// Power cycle a dongle through the reset program.
    Reset(Reset),
}

/// Helpful examples for users.
#[derive(Subcommand, Clone)]
pub enum Examples {
    /// Show an example of a configuration file's contents.
    Config,
}

/// What to reset.
#[derive(clap::Args, Clone)]
pub struct Reset {
    /// The name of a device found by a scan.
    pub name: Option<String>,

    /// Reset by device path instead.
    #[command(subcommand)]
    pub by: Option<ResetBy>,
}

/// Other ways to say what to reset.
#[derive(Subcommand, Clone)]
pub enum ResetBy {
    /// Reset the dongle at this device path.
    Path {
        /// E.g. `/dev/ttyUSB0`.
        path: String,
    },
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_commands() {
        let cli = Cli::parse_from(["dongle-ng", "config.ron", "dial", "m1/12345", "--hold", "3"]);
        assert_eq!(cli.config, Some(PathBuf::from("config.ron")));
        assert!(matches!(
            cli.command,
            Some(Commands::Dial { ref dial_string, hold: 3 }) if dial_string == "m1/12345"
        ));

        let cli = Cli::parse_from(["dongle-ng", "reset", "dongle0"]);
        assert!(matches!(
            cli.command,
            Some(Commands::Reset(Reset { name: Some(ref name), by: None })) if name == "dongle0"
        ));

        let cli = Cli::parse_from(["dongle-ng", "reset", "path", "/dev/ttyUSB0"]);
        assert!(matches!(
            cli.command,
            Some(Commands::Reset(Reset { name: None, by: Some(ResetBy::Path { ref path }) })) if path == "/dev/ttyUSB0"
        ));

        let cli = Cli::parse_from(["dongle-ng", "--log-level", "debug"]);
        assert_eq!(cli.log_level, Level::DEBUG);
        assert!(cli.command.is_none());
    }
}
