//! # SDR Opus Audio
//!
//! Real-time Opus audio core for a software-defined radio client: the
//! transmit path that captures the microphone and ships Opus frames to the
//! radio, and the receive path that decodes the radio's Opus stream and
//! plays it on the local output device.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────── TRANSMIT ─────────────────────────────────┐
//! │                                                                           │
//! │  Input device ──► capture callback ──► FormatConverter ──► RingBuffer     │
//! │                   (realtime thread)    native → 24 kHz      frame-indexed │
//! │                                        stereo f32                │        │
//! │                                                  counting signal │        │
//! │                                                                  ▼        │
//! │                   EncodedAudioSink ◄── OpusEncoder ◄── encode worker      │
//! │                   (network send)                       (normal thread)    │
//! └───────────────────────────────────────────────────────────────────────────┘
//!
//! ┌──────────────────────────────── RECEIVE ──────────────────────────────────┐
//! │                                                                           │
//! │  stream handler ──► OpusDecoder ──► RingBuffer ──► render callback ──►    │
//! │  (any thread,       (lost frames     frame-        (realtime thread,      │
//! │   push-style)        concealed)      indexed        converts to device    │
//! │                                                     format, silence on    │
//! │                                                     underrun)             │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Hardware is reached through [`audio::AudioBackend`]; [`audio::CpalBackend`]
//! drives real devices and [`audio::VirtualBackend`] runs the pipelines
//! headless.

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod network;

pub use error::{Error, Result};

/// Wire-level constants shared with the radio's audio protocol
pub mod constants {
    /// Opus sample rate of the remote audio streams
    pub const DEFAULT_SAMPLE_RATE: u32 = 24_000;

    /// Channel count of the remote audio streams (stereo)
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// Samples per channel in one Opus frame (10 ms at 24 kHz)
    pub const DEFAULT_FRAME_SIZE: usize = 240;

    /// Remote audio is always interleaved
    pub const DEFAULT_INTERLEAVED: bool = true;

    /// Default Opus bitrate in bits per second
    pub const DEFAULT_BITRATE: u32 = 64_000;

    /// Largest encoded Opus frame we accept
    pub const MAX_OPUS_PACKET: usize = 4000;

    /// Default UDP port for the demo transport
    pub const DEFAULT_UDP_PORT: u16 = 4991;

    /// Maximum packet size for UDP
    pub const MAX_PACKET_SIZE: usize = 1472; // MTU - IP/UDP headers
}
