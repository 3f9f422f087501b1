//! Transmit pipeline: microphone to Opus frames
//!
//! Three threads cooperate:
//!
//! - the hardware's capture callback converts each buffer to the wire
//!   format, stores whole blocks in the ring and signals the worker. It never
//!   blocks, allocates or logs.
//! - the encode worker waits on the signal, drains whole Opus frames from
//!   the ring, encodes them and hands them to the [`EncodedAudioSink`].
//! - the stream holder owns the hardware stream, which cannot leave the
//!   thread that built it, and tears it down on stop or device loss.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::backend::AudioBackend;
use crate::audio::buffer::{create_shared_buffer, SharedRingBuffer};
use crate::audio::convert::{ConvertStatus, FormatConverter, InputStatus, SourceBuffer, StreamFormat};
use crate::audio::device::{DeviceBinding, Direction};
use crate::audio::events::{EventHub, PipelineEvent};
use crate::audio::holder::{hold_stream, START_TIMEOUT};
use crate::codec::OpusEncoder;
use crate::config::{CaptureConfig, OpusConfig, WireFormat};
use crate::error::{AudioError, Result, RingBufferError};

/// Worker wake-up interval when no audio arrives
const WORKER_POLL: Duration = Duration::from_millis(50);

/// Receives encoded frames from the encode worker
pub trait EncodedAudioSink: Send + Sync {
    /// `samples` is the frame size in samples per channel
    fn send_encoded_audio(&self, payload: &[u8], samples: usize);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Capturing,
}

/// Counters shared with the realtime callback and the worker
#[derive(Default)]
struct Counters {
    callbacks: AtomicU64,
    frames_stored: AtomicU64,
    overruns: AtomicU64,
    frames_overwritten: AtomicU64,
    convert_errors: AtomicU64,
    signals_dropped: AtomicU64,
    frames_encoded: AtomicU64,
    bytes_encoded: AtomicU64,
    encode_errors: AtomicU64,
    resyncs: AtomicU64,
}

/// Snapshot of capture statistics
#[derive(Debug, Clone, Default)]
pub struct CaptureStats {
    pub callbacks: u64,
    /// Wire-format frames stored in the ring
    pub frames_stored: u64,
    pub overruns: u64,
    pub frames_overwritten: u64,
    pub convert_errors: u64,
    pub signals_dropped: u64,
    /// Opus frames handed to the sink
    pub frames_encoded: u64,
    pub bytes_encoded: u64,
    pub encode_errors: u64,
    /// Times the worker skipped ahead after falling a full ring behind
    pub resyncs: u64,
    pub fill_level: f32,
}

/// Captures from an input device and emits Opus frames
pub struct CapturePipeline {
    backend: Arc<dyn AudioBackend>,
    sink: Arc<dyn EncodedAudioSink>,
    events: Arc<EventHub>,
    wire: WireFormat,
    opus: OpusConfig,
    /// Converter output block in samples per channel
    block_frames: usize,
    ring_slots: usize,
    ring: SharedRingBuffer,
    active: Arc<AtomicBool>,
    counters: Arc<Counters>,
    device: Option<DeviceBinding>,
    holder: Option<JoinHandle<()>>,
    worker: Option<JoinHandle<()>>,
}

impl CapturePipeline {
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        sink: Arc<dyn EncodedAudioSink>,
        wire: WireFormat,
        opus: OpusConfig,
        capture: &CaptureConfig,
        events: Arc<EventHub>,
    ) -> Result<Self> {
        wire.validate()?;
        let block_frames = capture.block_frames.max(1) * wire.frame_size;
        let ring_slots = capture.ring_slots.max(2);
        let ring = create_shared_buffer(wire.channels as usize, block_frames * ring_slots)?;

        Ok(Self {
            backend,
            sink,
            events,
            wire,
            opus,
            block_frames,
            ring_slots,
            ring,
            active: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
            device: None,
            holder: None,
            worker: None,
        })
    }

    /// Start capturing from `device`
    ///
    /// A no-op while already capturing. On failure the pipeline is left idle.
    pub fn start(&mut self, device: &DeviceBinding) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        // Threads left over from a lost device
        self.join_threads();

        if !device.is_input() {
            return Err(AudioError::InvalidDevice(device.id.clone()).into());
        }

        let encoder = OpusEncoder::new(&self.wire, &self.opus)?;
        let converter = FormatConverter::new(
            device.format,
            StreamFormat::intermediate(&self.wire),
            self.block_frames,
        )?;

        self.ring.clear();
        let (signal_tx, signal_rx) = bounded::<()>(self.ring_slots);
        // New flag per session; an abandoned holder keeps its own, cleared one
        self.active = Arc::new(AtomicBool::new(true));

        let worker = {
            let ring = self.ring.clone();
            let active = self.active.clone();
            let sink = self.sink.clone();
            let counters = self.counters.clone();
            let frame_size = self.wire.frame_size;
            thread::Builder::new()
                .name("opus-encode".into())
                .spawn(move || encode_worker(ring, signal_rx, active, encoder, sink, counters, frame_size))
        };
        match worker {
            Ok(handle) => self.worker = Some(handle),
            Err(e) => {
                self.active.store(false, Ordering::SeqCst);
                return Err(AudioError::StreamError(e.to_string()).into());
            }
        }

        let (ready_tx, ready_rx) = bounded::<std::result::Result<(), AudioError>>(1);
        let holder = {
            let backend = self.backend.clone();
            let device = device.clone();
            let active = self.active.clone();
            let events = self.events.clone();
            let mut callback = CaptureCallback {
                converter,
                block: vec![0.0; self.block_frames * self.wire.channels as usize],
                block_frames: self.block_frames,
                write_at: 0,
                ring: self.ring.clone(),
                signal: signal_tx,
                active: self.active.clone(),
                counters: self.counters.clone(),
            };
            thread::Builder::new().name("capture-stream".into()).spawn(move || {
                let build_device = device.clone();
                hold_stream(
                    device,
                    move |on_error| {
                        backend.build_input(
                            &build_device,
                            Box::new(move |buffer: SourceBuffer<'_>| callback.process(buffer)),
                            on_error,
                        )
                    },
                    active,
                    events,
                    ready_tx,
                )
            })
        };
        match holder {
            Ok(handle) => self.holder = Some(handle),
            Err(e) => {
                self.rollback(false);
                return Err(AudioError::StreamError(e.to_string()).into());
            }
        }

        match ready_rx.recv_timeout(START_TIMEOUT) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.rollback(true);
                return Err(e.into());
            }
            Err(_) => {
                tracing::error!(device = %device.id, "Input stream did not start in time");
                self.rollback(false);
                return Err(AudioError::StartTimeout.into());
            }
        }

        tracing::info!(
            device = %device.id,
            native_rate = device.format.sample_rate,
            native_channels = device.format.channels,
            "Capture started"
        );
        self.device = Some(device.clone());
        self.events.emit(&PipelineEvent::Started {
            direction: Direction::Input,
            device: device.id.clone(),
        });
        Ok(())
    }

    /// Undo a failed start; a stuck holder is detached rather than joined
    fn rollback(&mut self, join_holder: bool) {
        self.active.store(false, Ordering::SeqCst);
        match self.holder.take() {
            Some(handle) if join_holder => {
                let _ = handle.join();
            }
            _ => {}
        }
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        self.ring.clear();
    }

    fn join_threads(&mut self) {
        // The holder goes first so the callback is gone before the worker
        if let Some(handle) = self.holder.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }

    /// Stop capturing; a no-op when idle
    ///
    /// After a device loss the session is already over; its finished
    /// threads are reaped without another `Stopped` event.
    pub fn stop(&mut self) {
        if self.holder.is_none() && self.worker.is_none() {
            return;
        }
        let was_running = self.active.swap(false, Ordering::SeqCst);
        self.join_threads();
        self.ring.clear();
        if !was_running {
            return;
        }
        self.device = None;

        tracing::info!(frames_encoded = self.counters.frames_encoded.load(Ordering::Relaxed), "Capture stopped");
        self.events.emit(&PipelineEvent::Stopped {
            direction: Direction::Input,
        });
    }

    /// Stop, then start on `device`
    pub fn restart(&mut self, device: &DeviceBinding) -> Result<()> {
        self.stop();
        self.start(device)
    }

    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> CaptureState {
        if self.is_running() {
            CaptureState::Capturing
        } else {
            CaptureState::Idle
        }
    }

    /// Device of the current or last session
    pub fn device(&self) -> Option<&DeviceBinding> {
        self.device.as_ref()
    }

    pub fn wire_format(&self) -> &WireFormat {
        &self.wire
    }

    pub fn stats(&self) -> CaptureStats {
        let c = &self.counters;
        CaptureStats {
            callbacks: c.callbacks.load(Ordering::Relaxed),
            frames_stored: c.frames_stored.load(Ordering::Relaxed),
            overruns: c.overruns.load(Ordering::Relaxed),
            frames_overwritten: c.frames_overwritten.load(Ordering::Relaxed),
            convert_errors: c.convert_errors.load(Ordering::Relaxed),
            signals_dropped: c.signals_dropped.load(Ordering::Relaxed),
            frames_encoded: c.frames_encoded.load(Ordering::Relaxed),
            bytes_encoded: c.bytes_encoded.load(Ordering::Relaxed),
            encode_errors: c.encode_errors.load(Ordering::Relaxed),
            resyncs: c.resyncs.load(Ordering::Relaxed),
            fill_level: self.ring.fill_level(),
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State owned by the realtime capture callback
struct CaptureCallback {
    converter: FormatConverter,
    block: Vec<f32>,
    block_frames: usize,
    /// Producer index in frames
    write_at: u64,
    ring: SharedRingBuffer,
    signal: Sender<()>,
    active: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl CaptureCallback {
    fn process(&mut self, buffer: SourceBuffer<'_>) {
        if !self.active.load(Ordering::Relaxed) {
            return;
        }
        self.counters.callbacks.fetch_add(1, Ordering::Relaxed);

        let mut pending = Some(buffer);
        loop {
            let status = self.converter.convert(&mut self.block, |_| {
                pending.take().map_or(InputStatus::NoDataNow, InputStatus::HaveData)
            });
            let converted = match status {
                Ok(ConvertStatus::HaveData) => true,
                Ok(_) => break,
                Err(_) => {
                    // Keep the clock running with one silent block
                    self.counters.convert_errors.fetch_add(1, Ordering::Relaxed);
                    self.converter.reset();
                    self.block.fill(0.0);
                    false
                }
            };

            match self.ring.store(&self.block, self.block_frames, self.write_at) {
                Ok(()) => {}
                Err(RingBufferError::Overrun { dropped }) => {
                    self.counters.overruns.fetch_add(1, Ordering::Relaxed);
                    self.counters.frames_overwritten.fetch_add(dropped, Ordering::Relaxed);
                }
                Err(_) => {
                    self.counters.convert_errors.fetch_add(1, Ordering::Relaxed);
                    break;
                }
            }
            self.write_at += self.block_frames as u64;
            self.counters
                .frames_stored
                .fetch_add(self.block_frames as u64, Ordering::Relaxed);

            if self.signal.try_send(()).is_err() {
                self.counters.signals_dropped.fetch_add(1, Ordering::Relaxed);
            }

            if !converted {
                break;
            }
        }
    }
}

fn encode_worker(
    ring: SharedRingBuffer,
    signal: Receiver<()>,
    active: Arc<AtomicBool>,
    mut encoder: OpusEncoder,
    sink: Arc<dyn EncodedAudioSink>,
    counters: Arc<Counters>,
    frame_size: usize,
) {
    let mut pcm = vec![0.0f32; encoder.samples_per_frame()];
    let mut read_at: u64 = 0;

    loop {
        match signal.recv_timeout(WORKER_POLL) {
            Ok(()) => {}
            Err(RecvTimeoutError::Timeout) => {
                if active.load(Ordering::Relaxed) {
                    continue;
                }
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if !active.load(Ordering::Relaxed) {
            break;
        }

        let tail = ring.tail();
        if read_at < tail {
            tracing::warn!(skipped = tail - read_at, "Encoder fell behind, resyncing to oldest audio");
            counters.resyncs.fetch_add(1, Ordering::Relaxed);
            read_at = tail;
        }

        while ring.available_from(read_at) >= frame_size as u64 {
            if let Err(e) = ring.fetch(&mut pcm, frame_size, read_at) {
                tracing::debug!("Ring fetch at {}: {}", read_at, e);
            }
            read_at += frame_size as u64;

            match encoder.encode(&pcm) {
                Ok(payload) => {
                    counters.frames_encoded.fetch_add(1, Ordering::Relaxed);
                    counters.bytes_encoded.fetch_add(payload.len() as u64, Ordering::Relaxed);
                    sink.send_encoded_audio(payload, frame_size);
                }
                Err(e) => {
                    counters.encode_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::error!("Opus encode failed: {}", e);
                }
            }
        }
    }

    tracing::debug!(
        frames = encoder.stats().frames_encoded,
        "Encode worker exiting"
    );
}
