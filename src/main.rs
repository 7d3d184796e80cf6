use std::{sync::Arc, time::Duration};

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use dongle_ng::{
    cli::{self, Commands, Examples, Reset, ResetBy},
    config::Config,
    control_center::ControlCenter,
    dial::DialString,
    events::Event,
    logging,
    reset::ResetTarget,
    serial::SerialOpener,
};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

use tracing::{debug, info, warn};

fn load_config(cli: &cli::Cli) -> Result<Config> {
    let config = if let Some(config_path) = &cli.config {
        debug!(?config_path, "Config from path");
        Config::new_from_path(config_path)?
    } else {
        debug!("Default config");
        Config::default()
    };

    Ok(config)
}

async fn wait_for_quit() -> Result<()> {
    #[cfg(unix)]
    {
        let mut hangup = signal(SignalKind::hangup())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C, quitting")
            }
            _ = hangup.recv() => {
                info!("Told to hang up, quitting")
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Ctrl-C, quitting")
    }

    Ok(())
}

async fn serve(control_center: &ControlCenter) -> Result<()> {
    let report = control_center.scan().await;
    if report.found.is_empty() {
        warn!("No modems found, running without devices");
    }

    let mut events = BroadcastStream::new(control_center.events().subscribe());

    let quit = wait_for_quit();
    tokio::pin!(quit);

    loop {
        tokio::select! {
            quit = &mut quit => return quit,
            event = events.next() => match event {
                Some(Ok(event)) => println!("{}", serde_json::to_string(&event)?),
                Some(Err(e)) => warn!(%e, "Missed events"),
                None => return Err(eyre!("Event stream ended")),
            },
        }
    }
}

async fn dial(control_center: &ControlCenter, dial_string: &str, hold: u64) -> Result<()> {
    control_center.scan().await;

    let mut events = BroadcastStream::new(control_center.events().subscribe());

    let DialString { device, number } = dial_string.parse()?;

    let call = control_center.dial(&device, &number).await?;
    info!(call = %call.id, "Dialing, holding for {hold}s");

    let hold = tokio::time::sleep(Duration::from_secs(hold));
    tokio::pin!(hold);

    loop {
        tokio::select! {
            _ = &mut hold => break,
            event = events.next() => match event {
                Some(Ok(event)) => {
                    println!("{}", serde_json::to_string(&event)?);

                    if matches!(&event.inner, Event::CallFailed { call: id, .. } if *id == call.id) {
                        return Ok(());
                    }
                }
                Some(Err(e)) => warn!(%e, "Missed events"),
                None => break,
            },
        }
    }

    control_center.hangup(&device).await?;

    Ok(())
}

async fn run(command: Option<Commands>, control_center: &ControlCenter) -> Result<()> {
    match command {
        None => serve(control_center).await,
        Some(Commands::Scan) => {
            let report = control_center.scan().await;
            debug!(?report, "Scanned");

            println!(
                "{}",
                serde_json::to_string_pretty(&control_center.devices())?
            );
            Ok(())
        }
        Some(Commands::Dial { dial_string, hold }) => dial(control_center, &dial_string, hold).await,
        Some(Commands::Reset(Reset { name, by })) => {
            let target = match (name, by) {
                (_, Some(ResetBy::Path { path })) => ResetTarget::Path(path),
                (Some(name), None) => {
                    control_center.scan().await;
                    ResetTarget::Name(name)
                }
                (None, None) => return Err(eyre!("Say which device to reset")),
            };

            let path = control_center.reset(target).await?;
            println!("{path}");
            Ok(())
        }
        Some(Commands::Examples(_)) => Ok(()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = cli::Cli::parse();

    if let Some(Commands::Examples(Examples::Config)) = &cli.command {
        println!("{}", Config::example().serialize_pretty()?);
        return Ok(());
    }

    logging::init(
        cli.log_level,
        cli.log_dir.clone().map(|dir| (cli.log_level, dir)),
    )
    .await;

    let config = load_config(&cli)?;
    let opener = Arc::new(SerialOpener::new(config.discovery.baud));
    let control_center = ControlCenter::new(config, opener)?;

    let result = run(cli.command, &control_center).await;

    control_center.shutdown().await;
    logging::shutdown();

    result
}
