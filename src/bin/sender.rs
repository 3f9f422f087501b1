//! Audio Sender Application
//!
//! Captures the microphone and streams Opus frames to a receiver over UDP.
//!
//! Usage: `sender [peer-address]`

use anyhow::{Context, Result};
use crossbeam_channel::RecvTimeoutError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sdr_opus_audio::{
    audio::{
        device::{input_devices, resolve_device, Direction},
        CapturePipeline, CpalBackend, EventHub, PipelineEvent,
    },
    config::AppConfig,
    network::UdpAudioSink,
};

const STATS_INTERVAL: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Opus audio sender");

    let mut config = AppConfig::load(None)?;
    if let Some(addr) = std::env::args().nth(1) {
        config.network.peer_address = addr
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid peer address: {addr}"))?;
    }

    println!("\n=== Input Devices ===");
    for device in input_devices() {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}{}", device.name, default_marker);
        println!("    ID: {}", device.id);
        println!(
            "    Format: {} Hz, {} ch, {:?}",
            device.format.sample_rate, device.format.channels, device.format.sample_format
        );
    }
    println!();

    let device = resolve_device(config.capture.device.as_deref(), Direction::Input)
        .context("No usable input device")?;

    let sink = Arc::new(UdpAudioSink::connect(&config.network)?);
    let events = Arc::new(EventHub::new());
    let mut capture = CapturePipeline::new(
        Arc::new(CpalBackend::new()),
        sink.clone(),
        config.wire,
        config.opus.clone(),
        &config.capture,
        events.clone(),
    )?;

    // Restarts happen on this thread, never inside the handler
    let (lost_tx, lost_rx) = crossbeam_channel::unbounded();
    events.subscribe(move |event| {
        if let PipelineEvent::DeviceLost { device, .. } = event {
            let _ = lost_tx.send(device.clone());
        }
    });

    capture.start(&device)?;
    tracing::info!(
        "Streaming {} Hz, {} ch, {:.1} ms frames to {}",
        config.wire.sample_rate,
        config.wire.channels,
        config.wire.frame_duration_ms(),
        sink.peer()
    );

    loop {
        match lost_rx.recv_timeout(STATS_INTERVAL) {
            Ok(lost) => {
                tracing::warn!("Input device {} disappeared, switching to default", lost);
                std::thread::sleep(Duration::from_secs(1));
                match resolve_device(None, Direction::Input) {
                    Ok(device) => {
                        if let Err(e) = capture.restart(&device) {
                            tracing::error!("Failed to restart capture: {}", e);
                        }
                    }
                    Err(e) => tracing::error!("No input device available: {}", e),
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                let stats = capture.stats();
                tracing::info!(
                    "Stats: {} frames encoded, {} packets sent, {:.1} KB, {} overruns, {} send errors",
                    stats.frames_encoded,
                    sink.packets_sent(),
                    stats.bytes_encoded as f64 / 1024.0,
                    stats.overruns,
                    sink.send_errors()
                );
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    capture.stop();
    Ok(())
}
