use std::sync::Arc;

use clap::Parser;
use log::debug;
use tokio::sync::watch;

use crate::conf::{Cli, Setup};
use crate::core::sched::Scheduler;
use crate::netio::relay::{PacketRelay, RawSocketRelay, RelayConfig};

pub mod conf;
pub mod core;
pub mod netio;
pub mod utils;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("dhcperf: {e:#}");
        std::process::exit(1);
    }
    println!("done.");
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    utils::logger::init_logger(cli.debug)?;

    let iface_mac = mac_address::mac_address_by_name(&cli.iface)
        .ok()
        .flatten();
    let setup = Arc::new(Setup::from_cli(cli, iface_mac)?);

    let relay: Arc<dyn PacketRelay> = Arc::new(RawSocketRelay::new(
        &setup.ifname,
        RelayConfig {
            debug: setup.debug,
            ..Default::default()
        },
    )?);

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        println!("\nstopping...");
        let _ = stop_tx.send(true);
    });

    let sched = Scheduler::new(setup, relay.clone(), stop_rx)?;
    sched.run().await?;

    relay.stop();
    debug!("relay stats: {:?}", relay.stats());
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(s) => s,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
