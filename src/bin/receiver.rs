//! Audio Receiver Application
//!
//! Receives Opus frames over UDP and plays them on the output device.
//!
//! Usage: `receiver [bind-address]`

use anyhow::{Context, Result};
use crossbeam_channel::RecvTimeoutError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sdr_opus_audio::{
    audio::{
        device::{output_devices, resolve_device, Direction},
        CpalBackend, EventHub, PipelineEvent, PlaybackPipeline,
    },
    config::AppConfig,
    network::UdpAudioReceiver,
};

const STATS_INTERVAL: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Opus audio receiver");

    let mut config = AppConfig::load(None)?;
    if let Some(addr) = std::env::args().nth(1) {
        config.network.bind_address = addr
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid bind address: {addr}"))?;
    }

    println!("\n=== Output Devices ===");
    for device in output_devices() {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}{}", device.name, default_marker);
        println!("    ID: {}", device.id);
        println!(
            "    Format: {} Hz, {} ch, {:?}",
            device.format.sample_rate, device.format.channels, device.format.sample_format
        );
    }
    println!();

    let device = resolve_device(config.playback.device.as_deref(), Direction::Output)
        .context("No usable output device")?;

    let events = Arc::new(EventHub::new());
    let playback = Arc::new(PlaybackPipeline::new(
        Arc::new(CpalBackend::new()),
        config.wire,
        &config.playback,
        events.clone(),
    )?);

    let (lost_tx, lost_rx) = crossbeam_channel::unbounded();
    events.subscribe(move |event| {
        if let PipelineEvent::DeviceLost { device, .. } = event {
            let _ = lost_tx.send(device.clone());
        }
    });

    playback.start(&device)?;
    let mut receiver = UdpAudioReceiver::spawn(&config.network, playback.clone())?;
    tracing::info!("Playing on {} - press Ctrl+C to stop", device.name);

    loop {
        match lost_rx.recv_timeout(STATS_INTERVAL) {
            Ok(lost) => {
                tracing::warn!("Output device {} disappeared, switching to default", lost);
                std::thread::sleep(Duration::from_secs(1));
                match resolve_device(None, Direction::Output) {
                    Ok(device) => {
                        if let Err(e) = playback.restart_with(&device) {
                            tracing::error!("Failed to restart playback: {}", e);
                        }
                    }
                    Err(e) => tracing::error!("No output device available: {}", e),
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                let stats = playback.stats();
                let net = receiver.stats();
                tracing::info!(
                    "Stats: {} packets, {} concealed, {} late, {} underruns, buffer {:.0}%",
                    net.packets,
                    stats.frames_concealed,
                    net.late,
                    stats.underruns,
                    stats.fill_level * 100.0
                );
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    receiver.stop();
    playback.stop();
    Ok(())
}
