//! Stream holder thread shared by both pipelines
//!
//! Hardware streams may not leave the thread that built them, so each
//! session gets a thread that builds the stream, plays it, reports back and
//! then parks until the session ends or the device disappears.

use crossbeam_channel::{bounded, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::audio::backend::{ErrorCallback, HardwareStream};
use crate::audio::device::DeviceBinding;
use crate::audio::events::{EventHub, PipelineEvent};
use crate::error::AudioError;

/// How long `start` waits for the holder to report
pub(crate) const START_TIMEOUT: Duration = Duration::from_secs(2);

const POLL: Duration = Duration::from_millis(10);

pub(crate) type Ready = Sender<Result<(), AudioError>>;

/// Body of a holder thread
///
/// `active` is the session's own flag: a fresh one per `start`, so a holder
/// abandoned after a start timeout never plays alongside its successor.
/// `build` receives the error callback to hand to the backend. On device
/// loss the session is marked inactive before the stream is dropped, and
/// `DeviceLost` is emitted afterwards.
pub(crate) fn hold_stream<F>(
    device: DeviceBinding,
    build: F,
    active: Arc<AtomicBool>,
    events: Arc<EventHub>,
    ready: Ready,
) where
    F: FnOnce(ErrorCallback) -> Result<Box<dyn HardwareStream>, AudioError>,
{
    let (error_tx, error_rx) = bounded::<AudioError>(16);
    let on_error: ErrorCallback = Box::new(move |err: AudioError| {
        let _ = error_tx.try_send(err);
    });

    let stream = match build(on_error) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(device = %device.id, "Failed to open stream: {}", e);
            let _ = ready.send(Err(e));
            return;
        }
    };
    // The session gave up waiting while the build was in progress
    if !active.load(Ordering::SeqCst) {
        tracing::warn!(device = %device.id, "Discarding stream of an abandoned session");
        return;
    }
    if let Err(e) = stream.play() {
        tracing::error!(device = %device.id, "Failed to start stream: {}", e);
        let _ = ready.send(Err(e));
        return;
    }
    let _ = ready.send(Ok(()));

    let mut lost = None;
    while active.load(Ordering::Relaxed) {
        match error_rx.try_recv() {
            Ok(AudioError::DeviceLost(reason)) => {
                lost = Some(reason);
                break;
            }
            Ok(e) => tracing::warn!(device = %device.id, "Stream error: {}", e),
            Err(_) => thread::sleep(POLL),
        }
    }

    if lost.is_some() {
        active.store(false, Ordering::SeqCst);
    }
    // Stream is dropped here, halting the hardware
    drop(stream);

    if let Some(reason) = lost {
        tracing::warn!(device = %device.id, "Device lost, pipeline stopped");
        events.emit(&PipelineEvent::DeviceLost {
            direction: device.direction,
            device: device.id.clone(),
            reason,
        });
    }
}
