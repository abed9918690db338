mod config;
mod prompt;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use salvage_transfer::{
    RateHint, ReceiverConfig, SenderConfig, TracingLogger, UdpTransport, run_receiver, run_sender,
};

use crate::config::Config;

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "salvage_cli=info,salvage_transfer=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    match std::env::args().nth(1).as_deref() {
        Some("send") => send(&config),
        Some("receive") => receive(&config),
        _ => {
            eprintln!("usage: salvage <send|receive>");
            std::process::exit(2);
        }
    }
}

fn send(config: &Config) -> anyhow::Result<()> {
    let file = prompt::required("File to send")?;
    let name = prompt::required("Request name")?;
    let rate: i32 = prompt::parsed("Rate index (<0 = adaptive)", -1)?;
    let hold: u64 = prompt::parsed("Hold seconds", 0)?;

    let transport = UdpTransport::bind(config.bind, config.peer)
        .with_context(|| format!("cannot bind {}", config.bind))?;
    info!(bind = %config.bind, peer = %config.peer, "transport ready");

    let mut sender = SenderConfig::new(&file, &name);
    sender.rate = RateHint::from_signed(rate);
    sender.hold = Duration::from_secs(hold);
    sender.logger = Some(Arc::new(TracingLogger));

    let report = run_sender(&transport, sender).with_context(|| format!("sending {file}"))?;
    println!(
        "sent {} as {}: {} frames, {} bytes, sha256 {}",
        file, report.codec, report.frames, report.bytes, report.input_sha256
    );
    Ok(())
}

fn receive(config: &Config) -> anyhow::Result<()> {
    let file = prompt::required("Save as")?;
    let name = prompt::required("Request name")?;

    let transport = UdpTransport::bind(config.bind, config.peer)
        .with_context(|| format!("cannot bind {}", config.bind))?;
    info!(bind = %config.bind, peer = %config.peer, "transport ready");

    let mut receiver = ReceiverConfig::new(&name, &file);
    receiver.staging_dir = config.staging_dir.clone();
    receiver.idle_timeout = config.idle_timeout;
    receiver.logger = Some(Arc::new(TracingLogger));

    let report = run_receiver(&transport, receiver).with_context(|| format!("receiving {name}"))?;
    println!(
        "received {} as {}: {} frames (seq {}..={}), {} bytes written, loss {:.1}%, sha256 {}",
        file,
        report.codec,
        report.frames,
        report.range.lowest,
        report.range.highest,
        report.output_bytes,
        report.stats.loss_pct(),
        report.output_sha256
    );
    Ok(())
}
