//! Main CLI for insint
// (c) 2024 Ross Younger

use std::ffi::OsString;
use std::io::IsTerminal as _;
use std::process::ExitCode;

use anyhow::{Context, Result};
use tracing::info;

use super::args::{CliArgs, MainMode};
use super::styles::{error, use_colours};
use crate::{
    config::{Configuration, Manager},
    container::{Collaborators, InterfaceContainer},
    util::{ConsoleTraceType, setup_tracing, trace_level},
};

/// Main CLI entrypoint
///
/// Call this from `main`, passing the arguments to use.
/// Normally you will call `cli(std::env::args_os())` but you can pass in alternate arguments for CLI testing.
///
/// # Safety
/// - This function may start a tokio runtime and perform work in it.
/// - This function is not safe to call from multi-threaded code.
#[must_use]
pub fn cli<I, T>(args: I) -> ExitCode
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    #[allow(clippy::match_bool)] // improved readability
    cli_inner(args)
        .inspect_err(|e| {
            if crate::util::tracing_is_initialised() {
                tracing::error!("{e:#}");
            } else {
                let style = error();
                eprintln!("{style}Error:{style:#} {e:#}");
            }
        })
        .map_or(ExitCode::FAILURE, |success| match success {
            true => ExitCode::SUCCESS,
            false => ExitCode::FAILURE,
        })
}

/// Inner CLI logic
///
/// # Return
/// true indicates success. false indicates a failure where the callee has output to stderr.
fn cli_inner<I, T>(args: I) -> Result<bool>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let Some(args) = parse_args(args)? else {
        return Ok(true); // help/version shown; exit
    };

    let mut manager = Manager::standard();
    manager.merge_provider(args.overrides.clone());
    manager.apply_system_default();

    match args.mode() {
        MainMode::ShowConfigFiles => {
            println!("{:?}", Manager::config_files());
            Ok(true)
        }
        MainMode::ShowConfig => {
            print!("{}", show_config_data(&manager));
            let _ = manager.configuration()?;
            Ok(true)
        }
        MainMode::Run | MainMode::Send => {
            let config = manager.configuration()?;
            run(&args, &config)
        }
    }
}

fn parse_args<I, T>(args: I) -> Result<Option<Box<CliArgs>>>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    use clap::error::ErrorKind::{DisplayHelp, DisplayVersion};
    match CliArgs::custom_parse(args) {
        Ok(args) => Ok(Some(Box::new(args))),
        Err(e) if matches!(e.kind(), DisplayHelp | DisplayVersion) => {
            let message = e.render();
            if use_colours() {
                println!("{}", message.ansi());
            } else {
                println!("{message}");
            }
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

fn show_config_data(manager: &Manager) -> String {
    format!("Configuration:\n{}", manager.to_display_adapter())
}

// RUN MODES ///////////////////////////////////////////////////////////////

#[tokio::main]
async fn run(args: &CliArgs, config: &Configuration) -> Result<bool> {
    setup_tracing(
        trace_level(args.debug, args.quiet),
        ConsoleTraceType::Standard,
        config.log_file.as_ref(),
        config.time_format,
        std::io::stderr().is_terminal() && use_colours(),
    )?;

    let collaborators = Collaborators::from_config(config)?;
    let container = InterfaceContainer::start(config, collaborators)
        .await
        .context("starting interfaces")?;

    let result = if let Some((tag, command)) = args.send_args() {
        send_one(&container, tag, command).await
    } else {
        info!(
            "OBCP {} ({}) interfaces running; interrupt to stop",
            config.obcp_num, config.obcp_host
        );
        tokio::signal::ctrl_c()
            .await
            .context("waiting for interrupt")?;
        info!("interrupted, shutting down");
        Ok(true)
    };
    container.stop().await;
    result
}

async fn send_one(container: &InterfaceContainer, tag: &str, command: &str) -> Result<bool> {
    let event = container.await_completion(tag, command).await?;
    println!("{}", serde_json::to_string(&event.fields)?);
    let result = event
        .fields
        .get("result")
        .and_then(serde_json::Value::as_i64);
    Ok(result == Some(0))
}
