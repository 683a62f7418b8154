//! rbmctool - command line view of the redundant BMC manager.

mod display;
mod reset;

use anyhow::Result;
use clap::Parser;
use rbmc_common::bus::BusClient;
use rbmc_common::ipc::{IpcError, Method, ResponseData};
use rbmc_common::paths;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Redundant BMC manager tool
#[derive(Parser)]
#[command(name = "rbmctool")]
#[command(about = "Display and control BMC redundancy", long_about = None)]
#[command(arg_required_else_help = true)]
struct Args {
    /// Display basic redundancy information
    #[arg(short = 'd', long = "display")]
    display: bool,

    /// Add extended details to the display
    #[arg(short = 'e', long = "extended", requires = "display")]
    extended: bool,

    /// Set the disable-redundancy override
    #[arg(
        short = 's',
        long = "set-disable-redundancy-override",
        conflicts_with = "clear_override"
    )]
    set_override: bool,

    /// Clear the disable-redundancy override
    #[arg(short = 'c', long = "clear-disable-redundancy-override")]
    clear_override: bool,

    /// Reset the sibling BMC
    #[arg(long = "reset-sibling")]
    reset_sibling: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "rbmctool=warn".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .without_time()
                .with_target(false),
        )
        .init();

    let args = Args::parse();

    if args.reset_sibling {
        reset::reset_sibling()?;
    }

    if args.set_override || args.clear_override {
        set_disable_redundancy_override(args.set_override).await?;
    }

    if args.display {
        display::display_local_bmc_info(args.extended).await?;
    }

    Ok(())
}

async fn set_disable_redundancy_override(disable: bool) -> Result<()> {
    let mut client = BusClient::connect(paths::RBMCD_SOCKET).await?;

    match client
        .call(Method::SetDisableRedundancyOverride { disable })
        .await
    {
        Ok(ResponseData::Ok) => {
            println!(
                "Disable redundancy override {}",
                if disable { "set" } else { "cleared" }
            );
            Ok(())
        }
        Ok(other) => anyhow::bail!("unexpected response: {other:?}"),
        Err(e) => {
            if let Some(IpcError::Unavailable(reason)) = e.downcast_ref::<IpcError>() {
                eprintln!(
                    "The request was rejected: {reason}.\n\
                     The override can only be changed while the system is \
                     powered off and no full sync is running."
                );
                std::process::exit(1);
            }
            Err(e)
        }
    }
}
