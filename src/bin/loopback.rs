//! Local loopback
//!
//! Microphone → Opus encode → Opus decode → speaker in one process, for
//! checking devices and latency without a radio.

use anyhow::{Context, Result};
use crossbeam_channel::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sdr_opus_audio::{
    audio::{
        device::{resolve_device, Direction},
        CapturePipeline, CompressedFrameHandler, CpalBackend, EncodedAudioSink, EventHub, PipelineEvent,
        PlaybackPipeline,
    },
    codec::CompressedFrame,
    config::AppConfig,
};

/// Hands encoded frames straight to the playback pipeline
struct LoopbackSink {
    playback: Arc<PlaybackPipeline>,
}

impl EncodedAudioSink for LoopbackSink {
    fn send_encoded_audio(&self, payload: &[u8], samples: usize) {
        self.playback
            .on_compressed_frame(CompressedFrame::from_wire(payload, samples));
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::load(std::env::args().nth(1).as_deref().map(std::path::Path::new))?;
    let backend = Arc::new(CpalBackend::new());
    let events = Arc::new(EventHub::new());

    let playback = Arc::new(PlaybackPipeline::new(
        backend.clone(),
        config.wire,
        &config.playback,
        events.clone(),
    )?);
    let mut capture = CapturePipeline::new(
        backend,
        Arc::new(LoopbackSink {
            playback: playback.clone(),
        }),
        config.wire,
        config.opus.clone(),
        &config.capture,
        events.clone(),
    )?;

    let (lost_tx, lost_rx) = crossbeam_channel::unbounded();
    events.subscribe(move |event| {
        if let PipelineEvent::DeviceLost { direction, .. } = event {
            let _ = lost_tx.send(*direction);
        }
    });

    let output = resolve_device(config.playback.device.as_deref(), Direction::Output)
        .context("No usable output device")?;
    let input = resolve_device(config.capture.device.as_deref(), Direction::Input)
        .context("No usable input device")?;
    playback.start(&output)?;
    capture.start(&input)?;
    tracing::info!("Looping {} → {}", input.name, output.name);

    loop {
        match lost_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(direction) => {
                tracing::warn!("{:?} device lost, switching to default", direction);
                let restarted = resolve_device(None, direction).map_err(anyhow::Error::from).and_then(|device| {
                    match direction {
                        Direction::Input => capture.restart(&device)?,
                        Direction::Output => playback.restart_with(&device)?,
                    }
                    Ok(())
                });
                if let Err(e) = restarted {
                    tracing::error!("Failed to restart {:?} side: {}", direction, e);
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                let tx = capture.stats();
                let rx = playback.stats();
                tracing::info!(
                    "Stats: {} encoded, {} decoded, {} underruns, {} overruns",
                    tx.frames_encoded,
                    rx.frames_received,
                    rx.underruns,
                    tx.overruns + rx.overruns
                );
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    capture.stop();
    playback.stop();
    Ok(())
}
