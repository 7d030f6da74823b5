mod commandline;
mod daemon;
mod mqtt;

use anyhow::{Context, Result};
use clap::Parser;
use commandline::{CliArgs, CliCommands};
use dalyble_lib::protocol;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::{ops::Deref, panic};

fn logging_init(loglevel: LevelFilter) -> Result<LoggerHandle> {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .context("Cannot init logging")?
        .start()
        .context("Cannot start logging")?;

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    Ok(log_handle)
}

fn decode(notifications: &[String]) -> Result<()> {
    for (index, notification) in notifications.iter().enumerate() {
        let bytes = hex::decode(notification.trim())
            .with_context(|| format!("Invalid hex in notification #{}", index + 1))?;
        match protocol::decode_notification(&bytes) {
            Ok(frames) => {
                for frame in frames {
                    match frame {
                        Ok(frame) => println!("{}", serde_json::to_string_pretty(&frame)?),
                        Err(e) => println!("Notification #{}: {e}", index + 1),
                    }
                }
            }
            Err(e) => println!("Notification #{}: {e}", index + 1),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter())?;

    match &args.command {
        CliCommands::Decode { notifications } => decode(notifications)?,
        CliCommands::Acquire { output } => {
            let transport = daemon::transport(&args).await?;
            let sink = daemon::Sink::open(output)?;
            let outcome =
                daemon::run_once(transport, &args.devices, &args.session_config(), &sink).await;
            sink.close().await?;
            outcome?;
        }
        CliCommands::Daemon { output, interval } => {
            let transport = daemon::transport(&args).await?;
            daemon::run(
                transport,
                &args.devices,
                &args.session_config(),
                output,
                *interval,
            )
            .await?;
        }
    }

    Ok(())
}
