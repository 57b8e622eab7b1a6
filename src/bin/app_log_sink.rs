//! app_log_sink - Print logs posted by the mobile detection app.

use anyhow::Result;
use clap::Parser;
use std::sync::mpsc;

use mousedet_ops::config::OpsConfig;
use mousedet_ops::log_sink;

#[derive(Parser, Debug)]
#[command(name = "app_log_sink", about = "Receive POST /log entries from the mobile app")]
struct Args {
    /// Listen address (overrides MOUSEDET_LOG_SINK_ADDR)
    #[arg(long, value_name = "ADDR")]
    addr: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = OpsConfig::load()?;
    if let Some(addr) = args.addr {
        config.log_sink_addr = addr;
    }

    let handle = log_sink::spawn(&config.log_sink_addr)?;
    log::info!("log sink listening on http://{}/log", handle.addr);
    log::info!("waiting for logs from the app...");

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;
    let _ = rx.recv();
    handle.stop()?;
    Ok(())
}
