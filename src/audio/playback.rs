//! Receive pipeline: Opus frames to the speaker
//!
//! Frames are pushed in by the network side through
//! [`CompressedFrameHandler`], decoded on the caller's thread and stored in
//! the ring by frame index. The render callback pulls from the ring at its
//! own pace, converting to the device format when it differs from the wire
//! format, and plays silence whenever the ring runs dry.

use crossbeam_channel::bounded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::audio::backend::AudioBackend;
use crate::audio::buffer::{create_shared_buffer, SharedRingBuffer};
use crate::audio::convert::{ConvertStatus, FormatConverter, InputStatus, SourceBuffer, StreamFormat};
use crate::audio::device::{DeviceBinding, Direction};
use crate::audio::events::{EventHub, PipelineEvent};
use crate::audio::holder::{hold_stream, START_TIMEOUT};
use crate::codec::{CompressedFrame, OpusDecoder};
use crate::config::{PlaybackConfig, WireFormat};
use crate::error::{AudioError, Result, RingBufferError};

/// Push-style consumer of the radio's compressed audio stream
pub trait CompressedFrameHandler: Send + Sync {
    fn on_compressed_frame(&self, frame: CompressedFrame<'_>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Playing,
}

#[derive(Default)]
struct Counters {
    frames_received: AtomicU64,
    frames_concealed: AtomicU64,
    decode_errors: AtomicU64,
    dropped_while_idle: AtomicU64,
    overruns: AtomicU64,
    underruns: AtomicU64,
    frames_rendered: AtomicU64,
    silence_frames: AtomicU64,
    resyncs: AtomicU64,
    render_errors: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct PlaybackStats {
    pub frames_received: u64,
    /// Lost frames filled in by packet loss concealment
    pub frames_concealed: u64,
    pub decode_errors: u64,
    pub dropped_while_idle: u64,
    pub overruns: u64,
    pub underruns: u64,
    /// Wire-rate frames of decoded audio handed to the device
    pub frames_rendered: u64,
    /// Wire-rate frames of silence played on underrun
    pub silence_frames: u64,
    pub resyncs: u64,
    pub render_errors: u64,
    pub fill_level: f32,
}

struct DecodeState {
    /// Flag of the current session, shared with its holder and renderer
    session: Arc<AtomicBool>,
    decoder: Option<OpusDecoder>,
    pcm: Vec<f32>,
    /// Producer index in frames
    write_at: u64,
}

#[derive(Default)]
struct Control {
    device: Option<DeviceBinding>,
    holder: Option<JoinHandle<()>>,
}

/// Decodes the radio's Opus stream onto an output device
///
/// Shared behind an `Arc`: the network thread feeds it while the owner
/// starts, stops and restarts it.
pub struct PlaybackPipeline {
    backend: Arc<dyn AudioBackend>,
    events: Arc<EventHub>,
    wire: WireFormat,
    /// Cushion in wire-rate frames before rendering starts
    prefill: u64,
    ring: SharedRingBuffer,
    counters: Arc<Counters>,
    control: Mutex<Control>,
    decode: Mutex<DecodeState>,
}

impl PlaybackPipeline {
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        wire: WireFormat,
        playback: &PlaybackConfig,
        events: Arc<EventHub>,
    ) -> Result<Self> {
        wire.validate()?;
        let ring_frames = playback.ring_frames.max(2);
        let prefill = playback.prefill_frames.min(ring_frames - 1) * wire.frame_size;
        let ring = create_shared_buffer(wire.channels as usize, ring_frames * wire.frame_size)?;

        Ok(Self {
            backend,
            events,
            wire,
            prefill: prefill as u64,
            ring,
            counters: Arc::new(Counters::default()),
            control: Mutex::new(Control::default()),
            decode: Mutex::new(DecodeState {
                session: Arc::new(AtomicBool::new(false)),
                decoder: None,
                pcm: vec![0.0; wire.samples_per_frame()],
                write_at: 0,
            }),
        })
    }

    /// Start playing on `device`; a no-op while already playing
    pub fn start(&self, device: &DeviceBinding) -> Result<()> {
        {
            let mut control = self.control.lock();
            if self.is_running() {
                return Ok(());
            }
            if let Some(handle) = control.holder.take() {
                let _ = handle.join();
            }
            if !device.is_output() {
                return Err(AudioError::InvalidDevice(device.id.clone()).into());
            }

            let decoder = OpusDecoder::new(&self.wire)?;
            // New flag per session; an abandoned holder keeps its own, cleared one
            let session = Arc::new(AtomicBool::new(true));
            let mut renderer = Renderer::new(
                &self.wire,
                device.format,
                RingReader {
                    ring: self.ring.clone(),
                    read_at: 0,
                    primed: false,
                    prefill: self.prefill,
                    counters: self.counters.clone(),
                },
                session.clone(),
            )?;

            {
                let mut decode = self.decode.lock();
                self.ring.clear();
                decode.write_at = 0;
                decode.decoder = Some(decoder);
                decode.session = session.clone();
            }

            let (ready_tx, ready_rx) = bounded::<std::result::Result<(), AudioError>>(1);
            let spawned = {
                let backend = self.backend.clone();
                let device = device.clone();
                let active = session.clone();
                let events = self.events.clone();
                thread::Builder::new().name("playback-stream".into()).spawn(move || {
                    let build_device = device.clone();
                    hold_stream(
                        device,
                        move |on_error| {
                            backend.build_output(
                                &build_device,
                                Box::new(move |out: &mut [f32]| renderer.render(out)),
                                on_error,
                            )
                        },
                        active,
                        events,
                        ready_tx,
                    )
                })
            };
            let handle = match spawned {
                Ok(handle) => handle,
                Err(e) => {
                    self.rollback();
                    return Err(AudioError::StreamError(e.to_string()).into());
                }
            };

            match ready_rx.recv_timeout(START_TIMEOUT) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.rollback();
                    let _ = handle.join();
                    return Err(e.into());
                }
                Err(_) => {
                    tracing::error!(device = %device.id, "Output stream did not start in time");
                    // Detached; it exits once the build returns
                    self.rollback();
                    return Err(AudioError::StartTimeout.into());
                }
            }

            control.holder = Some(handle);
            control.device = Some(device.clone());
        }

        tracing::info!(
            device = %device.id,
            native_rate = device.format.sample_rate,
            native_channels = device.format.channels,
            "Playback started"
        );
        self.events.emit(&PipelineEvent::Started {
            direction: Direction::Output,
            device: device.id.clone(),
        });
        Ok(())
    }

    fn rollback(&self) {
        let mut decode = self.decode.lock();
        decode.session.store(false, Ordering::SeqCst);
        decode.decoder = None;
        self.ring.clear();
    }

    /// Stop playing; a no-op when idle
    ///
    /// After a device loss the session is already over; its finished
    /// holder is reaped without another `Stopped` event.
    pub fn stop(&self) {
        {
            let mut control = self.control.lock();
            let Some(holder) = control.holder.take() else {
                return;
            };
            let session = self.decode.lock().session.clone();
            let was_running = session.swap(false, Ordering::SeqCst);
            // Render callback is gone once the holder has dropped the stream
            let _ = holder.join();

            let mut decode = self.decode.lock();
            decode.decoder = None;
            decode.write_at = 0;
            self.ring.clear();
            if !was_running {
                return;
            }
            control.device = None;
        }

        tracing::info!(
            frames_received = self.counters.frames_received.load(Ordering::Relaxed),
            "Playback stopped"
        );
        self.events.emit(&PipelineEvent::Stopped {
            direction: Direction::Output,
        });
    }

    /// Stop, then start on `device`
    pub fn restart_with(&self, device: &DeviceBinding) -> Result<()> {
        self.stop();
        self.start(device)
    }

    pub fn is_running(&self) -> bool {
        self.decode.lock().session.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> PlaybackState {
        if self.is_running() {
            PlaybackState::Playing
        } else {
            PlaybackState::Idle
        }
    }

    pub fn device(&self) -> Option<DeviceBinding> {
        self.control.lock().device.clone()
    }

    pub fn wire_format(&self) -> &WireFormat {
        &self.wire
    }

    pub fn stats(&self) -> PlaybackStats {
        let c = &self.counters;
        PlaybackStats {
            frames_received: c.frames_received.load(Ordering::Relaxed),
            frames_concealed: c.frames_concealed.load(Ordering::Relaxed),
            decode_errors: c.decode_errors.load(Ordering::Relaxed),
            dropped_while_idle: c.dropped_while_idle.load(Ordering::Relaxed),
            overruns: c.overruns.load(Ordering::Relaxed),
            underruns: c.underruns.load(Ordering::Relaxed),
            frames_rendered: c.frames_rendered.load(Ordering::Relaxed),
            silence_frames: c.silence_frames.load(Ordering::Relaxed),
            resyncs: c.resyncs.load(Ordering::Relaxed),
            render_errors: c.render_errors.load(Ordering::Relaxed),
            fill_level: self.ring.fill_level(),
        }
    }
}

impl CompressedFrameHandler for PlaybackPipeline {
    fn on_compressed_frame(&self, frame: CompressedFrame<'_>) {
        let mut guard = self.decode.lock();
        let DecodeState {
            session,
            decoder,
            pcm,
            write_at,
        } = &mut *guard;

        let decoder = match decoder {
            Some(decoder) if session.load(Ordering::Acquire) => decoder,
            _ => {
                self.counters.dropped_while_idle.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("Dropping frame while idle");
                return;
            }
        };

        // A failed decode leaves the frame silent; it still takes its slot
        if let Err(e) = decoder.decode(frame, pcm) {
            self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
            tracing::error!("Opus decode failed: {}", e);
        }
        if frame.is_lost() {
            self.counters.frames_concealed.fetch_add(1, Ordering::Relaxed);
        }

        match self.ring.store(pcm, self.wire.frame_size, *write_at) {
            Ok(()) => {}
            Err(RingBufferError::Overrun { dropped }) => {
                self.counters.overruns.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(dropped, "Playback ring overrun");
            }
            Err(e) => tracing::warn!("Playback ring store failed: {}", e),
        }
        *write_at += self.wire.frame_size as u64;
        self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for PlaybackPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Consumer side of the playback ring
struct RingReader {
    ring: SharedRingBuffer,
    read_at: u64,
    /// False until the prefill cushion is buffered
    primed: bool,
    prefill: u64,
    counters: Arc<Counters>,
}

impl RingReader {
    /// Fill `dst` with `frames` wire-format frames, silence where none are buffered
    fn pull(&mut self, dst: &mut [f32], frames: usize) {
        let tail = self.ring.tail();
        if self.read_at < tail {
            // Lapped by the producer
            self.counters.resyncs.fetch_add(1, Ordering::Relaxed);
            self.read_at = tail;
        }

        if !self.primed {
            if self.ring.available_from(self.read_at) < self.prefill.max(1) {
                dst.fill(0.0);
                return;
            }
            self.primed = true;
        }

        let frames = frames as u64;
        match self.ring.fetch(dst, frames as usize, self.read_at) {
            Ok(()) => {
                self.counters.frames_rendered.fetch_add(frames, Ordering::Relaxed);
                self.read_at += frames;
            }
            Err(RingBufferError::Underrun { missing }) => {
                let played = frames.saturating_sub(missing);
                self.counters.underruns.fetch_add(1, Ordering::Relaxed);
                self.counters.silence_frames.fetch_add(missing, Ordering::Relaxed);
                self.counters.frames_rendered.fetch_add(played, Ordering::Relaxed);
                // Resume right after the last real frame once the cushion refills
                self.read_at += played;
                self.primed = false;
            }
            Err(RingBufferError::Overrun { .. }) => {
                self.counters.resyncs.fetch_add(1, Ordering::Relaxed);
                self.counters.frames_rendered.fetch_add(frames, Ordering::Relaxed);
                self.read_at += frames;
            }
            Err(_) => {
                self.counters.render_errors.fetch_add(1, Ordering::Relaxed);
                dst.fill(0.0);
            }
        }
    }
}

/// Realtime render state
struct Renderer {
    reader: RingReader,
    wire_channels: usize,
    /// `None` when the device runs in the wire format
    converter: Option<FormatConverter>,
    /// Wire-format input staged for the converter
    scratch: Vec<f32>,
    /// One converted block in the device format
    converted: Vec<f32>,
    converted_pos: usize,
    active: Arc<AtomicBool>,
}

impl Renderer {
    fn new(
        wire: &WireFormat,
        device_format: StreamFormat,
        reader: RingReader,
        active: Arc<AtomicBool>,
    ) -> Result<Self> {
        let source = StreamFormat::intermediate(wire);
        let destination = StreamFormat::intermediate(&WireFormat {
            sample_rate: device_format.sample_rate,
            channels: device_format.channels,
            ..*wire
        });

        let (converter, scratch, converted) = if source.same_shape(&destination) {
            (None, Vec::new(), Vec::new())
        } else {
            // One wire frame's worth of device-rate audio per block
            let block = (wire.frame_size as u64 * destination.sample_rate as u64 / source.sample_rate as u64).max(1);
            let converter = FormatConverter::new(source, destination, block as usize)?;
            let scratch = vec![0.0; converter.input_frames_max() * wire.channels as usize];
            let converted = vec![0.0; converter.block_samples()];
            (Some(converter), scratch, converted)
        };
        let converted_pos = converted.len();

        Ok(Self {
            reader,
            wire_channels: wire.channels as usize,
            converter,
            scratch,
            converted,
            converted_pos,
            active,
        })
    }

    fn render(&mut self, out: &mut [f32]) {
        if !self.active.load(Ordering::Relaxed) {
            out.fill(0.0);
            return;
        }
        if self.converter.is_none() {
            let frames = out.len() / self.wire_channels;
            let whole = frames * self.wire_channels;
            self.reader.pull(&mut out[..whole], frames);
            out[whole..].fill(0.0);
            return;
        }

        let mut written = 0;
        while written < out.len() {
            if self.converted_pos >= self.converted.len() {
                self.refill();
            }
            let n = (out.len() - written).min(self.converted.len() - self.converted_pos);
            out[written..written + n].copy_from_slice(&self.converted[self.converted_pos..self.converted_pos + n]);
            written += n;
            self.converted_pos += n;
        }
    }

    /// Convert the next block into `converted`
    fn refill(&mut self) {
        self.converted_pos = 0;
        let Some(converter) = self.converter.as_mut() else {
            self.converted.fill(0.0);
            return;
        };

        let needed = converter
            .input_frames_needed()
            .min(self.scratch.len() / self.wire_channels);
        let staged = &mut self.scratch[..needed * self.wire_channels];
        self.reader.pull(staged, needed);

        let mut pending = Some(SourceBuffer::F32(staged));
        let status = converter.convert(&mut self.converted, |_| {
            pending.take().map_or(InputStatus::NoDataNow, InputStatus::HaveData)
        });
        if !matches!(status, Ok(ConvertStatus::HaveData)) {
            self.reader.counters.render_errors.fetch_add(1, Ordering::Relaxed);
            converter.reset();
            self.converted.fill(0.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::virtual_device::VirtualBackend;
    use crate::codec::OpusEncoder;
    use crate::config::OpusConfig;
    use std::time::{Duration, Instant};

    fn wire() -> WireFormat {
        WireFormat {
            sample_rate: 48_000,
            channels: 1,
            frame_size: 480,
            interleaved: true,
        }
    }

    fn pipeline(backend: &VirtualBackend, events: Arc<EventHub>) -> PlaybackPipeline {
        PlaybackPipeline::new(Arc::new(backend.clone()), wire(), &PlaybackConfig::default(), events).unwrap()
    }

    /// Opus packets of a 440 Hz tone
    fn tone_packets(count: usize) -> Vec<Vec<u8>> {
        let mut encoder = OpusEncoder::new(&wire(), &OpusConfig::default()).unwrap();
        (0..count)
            .map(|n| {
                let frame: Vec<f32> = (0..480)
                    .map(|i| ((n * 480 + i) as f32 * 440.0 * std::f32::consts::TAU / 48_000.0).sin() * 0.5)
                    .collect();
                encoder.encode(&frame).unwrap().to_vec()
            })
            .collect()
    }

    fn energy(samples: &[f32]) -> f32 {
        samples.iter().map(|s| s * s).sum()
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_drops_frames_while_idle() {
        let backend = VirtualBackend::new();
        let playback = pipeline(&backend, Arc::new(EventHub::new()));
        playback.on_compressed_frame(CompressedFrame::Lost);
        assert_eq!(playback.stats().dropped_while_idle, 1);
        assert_eq!(playback.stats().frames_received, 0);
    }

    #[test]
    fn test_plays_after_prefill() {
        let backend = VirtualBackend::new();
        let playback = pipeline(&backend, Arc::new(EventHub::new()));
        let speaker = VirtualBackend::output_device("speaker", 48_000, 1);
        playback.start(&speaker).unwrap();
        assert_eq!(playback.state(), PlaybackState::Playing);

        let packets = tone_packets(6);
        let mut out = vec![1.0; 480];

        // Two frames do not fill the three-frame cushion
        for packet in &packets[..2] {
            playback.on_compressed_frame(CompressedFrame::Data(packet));
        }
        assert!(backend.pull_output(&mut out));
        assert!(out.iter().all(|&s| s == 0.0));

        for packet in &packets[2..] {
            playback.on_compressed_frame(CompressedFrame::Data(packet));
        }
        let mut played = Vec::new();
        for _ in 0..6 {
            backend.pull_output(&mut out);
            played.extend_from_slice(&out);
        }
        assert!(energy(&played[480..]) > 1.0);
        assert_eq!(playback.stats().frames_received, 6);
        assert_eq!(playback.stats().underruns, 0);
        assert_eq!(playback.stats().frames_rendered, 6 * 480);

        // The ring is drained; the next pull is an underrun
        backend.pull_output(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(playback.stats().underruns, 1);
        assert_eq!(playback.stats().silence_frames, 480);
    }

    #[test]
    fn test_lost_frames_keep_their_slot() {
        let backend = VirtualBackend::new();
        let playback = pipeline(&backend, Arc::new(EventHub::new()));
        playback.start(&VirtualBackend::output_device("speaker", 48_000, 1)).unwrap();

        let packets = tone_packets(2);
        playback.on_compressed_frame(CompressedFrame::Data(&packets[0]));
        playback.on_compressed_frame(CompressedFrame::Lost);
        playback.on_compressed_frame(CompressedFrame::from_wire(&packets[1], 480));

        let stats = playback.stats();
        assert_eq!(stats.frames_received, 3);
        assert_eq!(stats.frames_concealed, 1);
        assert!((stats.fill_level - 3.0 / 20.0).abs() < 1e-6);
    }

    #[test]
    fn test_converts_to_device_format() {
        let backend = VirtualBackend::new();
        let playback = pipeline(&backend, Arc::new(EventHub::new()));
        playback.start(&VirtualBackend::output_device("speaker", 44_100, 2)).unwrap();

        for packet in &tone_packets(10) {
            playback.on_compressed_frame(CompressedFrame::Data(packet));
        }

        let mut played = Vec::new();
        let mut out = vec![0.0; 512 * 2];
        for _ in 0..8 {
            assert!(backend.pull_output(&mut out));
            played.extend_from_slice(&out);
        }
        assert!(energy(&played) > 1.0);
        // Mono wire audio is duplicated into both device channels
        assert!(played.chunks_exact(2).all(|f| f[0] == f[1]));
        assert_eq!(playback.stats().render_errors, 0);
    }

    #[test]
    fn test_start_stop_lifecycle() {
        let backend = VirtualBackend::new();
        let playback = pipeline(&backend, Arc::new(EventHub::new()));
        let speaker = VirtualBackend::output_device("speaker", 48_000, 1);

        playback.stop();
        playback.start(&speaker).unwrap();
        playback.start(&speaker).unwrap();
        assert_eq!(backend.output_streams(), 1);

        playback.stop();
        assert_eq!(playback.state(), PlaybackState::Idle);
        assert_eq!(backend.output_streams(), 0);
        playback.on_compressed_frame(CompressedFrame::Lost);
        assert_eq!(playback.stats().dropped_while_idle, 1);

        let mic = VirtualBackend::input_device("mic", 48_000, 1);
        assert!(playback.start(&mic).is_err());
        assert_eq!(playback.state(), PlaybackState::Idle);
    }

    #[test]
    fn test_device_loss_and_restart() {
        let backend = VirtualBackend::new();
        let events = Arc::new(EventHub::new());
        let lost = Arc::new(AtomicBool::new(false));
        let flag = lost.clone();
        events.subscribe(move |e| {
            if matches!(e, PipelineEvent::DeviceLost { direction: Direction::Output, .. }) {
                flag.store(true, Ordering::SeqCst);
            }
        });
        let playback = pipeline(&backend, events);
        let speaker = VirtualBackend::output_device("speaker", 48_000, 1);
        playback.start(&speaker).unwrap();

        backend.disconnect(&speaker.id);
        assert!(wait_for(|| lost.load(Ordering::SeqCst)));
        assert_eq!(playback.state(), PlaybackState::Idle);

        let headphones = VirtualBackend::output_device("headphones", 48_000, 2);
        playback.restart_with(&headphones).unwrap();
        assert_eq!(playback.device().map(|d| d.id), Some("output:headphones".to_string()));
        assert_eq!(backend.output_streams(), 1);
    }

    #[test]
    fn test_start_timeout_leaves_single_consumer() {
        let backend = VirtualBackend::new();
        let playback = pipeline(&backend, Arc::new(EventHub::new()));
        let speaker = VirtualBackend::output_device("speaker", 48_000, 1);

        backend.stall_next_build(START_TIMEOUT + Duration::from_secs(1));
        assert!(matches!(
            playback.start(&speaker),
            Err(crate::Error::Audio(AudioError::StartTimeout))
        ));
        assert_eq!(playback.state(), PlaybackState::Idle);

        playback.start(&speaker).unwrap();
        thread::sleep(Duration::from_millis(1500));
        assert_eq!(backend.output_streams(), 1);
        assert!(playback.is_running());

        for packet in &tone_packets(4) {
            playback.on_compressed_frame(CompressedFrame::Data(packet));
        }
        let mut out = vec![0.0; 480];
        assert!(backend.pull_output(&mut out));
        assert_eq!(playback.stats().frames_rendered, 480);
    }

    #[test]
    fn test_stop_after_device_loss_is_silent() {
        let backend = VirtualBackend::new();
        let events = Arc::new(EventHub::new());
        let stopped = Arc::new(AtomicU64::new(0));
        let counter = stopped.clone();
        events.subscribe(move |e| {
            if matches!(e, PipelineEvent::Stopped { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        let playback = pipeline(&backend, events);
        let speaker = VirtualBackend::output_device("speaker", 48_000, 1);
        playback.start(&speaker).unwrap();

        backend.disconnect(&speaker.id);
        assert!(wait_for(|| playback.state() == PlaybackState::Idle));

        playback.stop();
        assert_eq!(stopped.load(Ordering::SeqCst), 0);
        assert_eq!(backend.output_streams(), 0);
    }

    /// Records the level of every event
    #[derive(Clone, Default)]
    struct Levels(Arc<Mutex<Vec<tracing::Level>>>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for Levels {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
            self.0.lock().push(*event.metadata().level());
        }
    }

    #[test]
    fn test_decode_fault_logged_as_error() {
        use tracing_subscriber::layer::SubscriberExt;

        let backend = VirtualBackend::new();
        let playback = pipeline(&backend, Arc::new(EventHub::new()));
        playback.start(&VirtualBackend::output_device("speaker", 48_000, 1)).unwrap();

        let levels = Levels::default();
        let subscriber = tracing_subscriber::registry().with(levels.clone());
        // Code 3 packet announcing zero frames
        tracing::subscriber::with_default(subscriber, || {
            playback.on_compressed_frame(CompressedFrame::Data(&[0x03, 0x00]));
        });

        assert_eq!(playback.stats().decode_errors, 1);
        assert_eq!(playback.stats().frames_received, 1);
        assert!(levels.0.lock().contains(&tracing::Level::ERROR));
    }
}
