//! Error types for the audio core

use thiserror::Error;

/// Umbrella error for setup paths
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Conversion error: {0}")]
    Convert(#[from] ConvertError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Device and stream errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device is not usable for this pipeline: {0}")]
    InvalidDevice(String),

    #[error("Device disappeared: {0}")]
    DeviceLost(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Could not allocate {0} samples of audio storage")]
    ResourceExhausted(usize),

    #[error("Hardware stream did not become ready in time")]
    StartTimeout,
}

/// Ring buffer store/fetch faults
///
/// Overrun and underrun are expected under load; callers count them and
/// carry on with silence.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingBufferError {
    #[error("Ring buffer storage is not allocated")]
    NotAllocated,

    #[error("Buffer holds {available} samples, {required} required")]
    LengthMismatch { required: usize, available: usize },

    #[error("{requested} frames exceed ring capacity of {capacity}")]
    TooMuch { requested: usize, capacity: usize },

    #[error("Frame {at} is behind the producer head at {head}")]
    Behind { at: u64, head: u64 },

    #[error("Buffer overrun, {dropped} unread frames overwritten")]
    Overrun { dropped: u64 },

    #[error("Buffer underrun, {missing} frames of silence")]
    Underrun { missing: u64 },
}

/// Format conversion errors
#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("Source carries {actual} channels, converter expects {expected}")]
    ChannelMismatch { expected: usize, actual: usize },

    #[error("Output buffer holds {actual} samples, {expected} required")]
    OutputSize { expected: usize, actual: usize },

    #[error("Unsupported layout: {0}")]
    UnsupportedLayout(String),

    #[error("Resampler setup failed: {0}")]
    ResamplerSetup(#[from] rubato::ResamplerConstructionError),

    #[error("Resampling failed: {0}")]
    Resample(#[from] rubato::ResampleError),
}

/// Opus codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Opus encoder setup failed: {0}")]
    EncoderInit(String),

    #[error("Opus decoder setup failed: {0}")]
    DecoderInit(String),

    #[error("Opus encode failed: {0}")]
    EncodingFailed(String),

    #[error("Opus decode failed: {0}")]
    DecodingFailed(String),

    #[error("{0} samples do not make one wire frame")]
    InvalidFrameSize(usize),
}

/// UDP transport errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Could not open UDP socket: {0}")]
    BindFailed(String),

    #[error("UDP send failed: {0}")]
    SendFailed(String),

    #[error("UDP receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Audio packet of {0} bytes exceeds one datagram")]
    PacketTooLarge(usize),

    #[error("Malformed audio packet")]
    InvalidPacket,
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
