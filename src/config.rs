//! Application configuration
//!
//! Loaded from a TOML file; every field has a default so a missing file or
//! a partial file both work.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::constants::*;
use crate::error::{Error, Result};

/// Opus sample rates accepted by libopus
const OPUS_SAMPLE_RATES: [u32; 5] = [8_000, 12_000, 16_000, 24_000, 48_000];

/// Opus frame durations in units of 0.5 ms
const OPUS_FRAME_HALF_MS: [u32; 6] = [5, 10, 20, 40, 80, 120];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub wire: WireFormat,
    pub opus: OpusConfig,
    pub capture: CaptureConfig,
    pub playback: PlaybackConfig,
    pub network: NetworkConfig,
}

/// Fixed audio format spoken on the wire
///
/// Encoder and decoder must agree on it; there is no negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WireFormat {
    pub sample_rate: u32,
    pub channels: u16,
    /// Samples per channel in one Opus frame
    pub frame_size: usize,
    pub interleaved: bool,
}

impl Default for WireFormat {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            frame_size: DEFAULT_FRAME_SIZE,
            interleaved: DEFAULT_INTERLEAVED,
        }
    }
}

impl WireFormat {
    /// Interleaved samples in one frame across all channels
    pub fn samples_per_frame(&self) -> usize {
        self.frame_size * self.channels as usize
    }

    pub fn frame_duration_ms(&self) -> f32 {
        self.frame_size as f32 * 1000.0 / self.sample_rate as f32
    }

    /// Frame size for a duration, in samples per channel
    pub fn frame_size_from_ms(sample_rate: u32, ms: f32) -> usize {
        (sample_rate as f32 * ms / 1000.0) as usize
    }

    pub fn validate(&self) -> Result<()> {
        if !OPUS_SAMPLE_RATES.contains(&self.sample_rate) {
            return Err(Error::Config(format!(
                "Opus does not support a sample rate of {} Hz",
                self.sample_rate
            )));
        }
        if !(1..=2).contains(&self.channels) {
            return Err(Error::Config(format!(
                "Opus streams carry 1 or 2 channels, not {}",
                self.channels
            )));
        }
        if !self.interleaved {
            return Err(Error::Config("wire audio must be interleaved".into()));
        }
        let half_ms = self.frame_size as u64 * 2000;
        let legal = half_ms % self.sample_rate as u64 == 0
            && OPUS_FRAME_HALF_MS.contains(&((half_ms / self.sample_rate as u64) as u32));
        if !legal {
            return Err(Error::Config(format!(
                "{} samples at {} Hz is not a legal Opus frame duration",
                self.frame_size, self.sample_rate
            )));
        }
        Ok(())
    }
}

/// Opus application mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpusApplication {
    Voip,
    Audio,
    LowDelay,
}

/// Opus encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpusConfig {
    pub application: OpusApplication,
    /// Bitrate in bits per second
    pub bitrate: u32,
    pub vbr: bool,
    /// Constrained VBR (only meaningful with `vbr`)
    pub cvbr: bool,
    /// In-band forward error correction
    pub fec: bool,
    /// Expected packet loss percentage, tunes FEC
    pub packet_loss_perc: u8,
    /// Size of the encoder's output buffer in bytes
    pub max_packet_size: usize,
}

impl Default for OpusConfig {
    fn default() -> Self {
        Self {
            application: OpusApplication::Audio,
            bitrate: DEFAULT_BITRATE,
            vbr: true,
            cvbr: true,
            fec: false,
            packet_loss_perc: 0,
            max_packet_size: MAX_OPUS_PACKET,
        }
    }
}

impl OpusConfig {
    pub fn voice() -> Self {
        Self {
            application: OpusApplication::Voip,
            bitrate: 32_000,
            fec: true,
            packet_loss_perc: 5,
            ..Self::default()
        }
    }
}

/// Transmit-side buffering
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Input device id, `None` selects the system default
    pub device: Option<String>,
    /// Converter output block in Opus frames; one block per ring store
    pub block_frames: usize,
    /// Ring capacity in blocks
    pub ring_slots: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: None,
            block_frames: 2,
            ring_slots: 8,
        }
    }
}

/// Receive-side buffering
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Output device id, `None` selects the system default
    pub device: Option<String>,
    /// Ring capacity in Opus frames
    pub ring_frames: usize,
    /// Opus frames buffered before the render callback starts consuming
    pub prefill_frames: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            device: None,
            ring_frames: 20,
            prefill_frames: 3,
        }
    }
}

/// Demo UDP transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bind_address: SocketAddr,
    pub peer_address: SocketAddr,
    /// Longest sequence gap turned into concealed frames
    pub max_concealed_gap: u32,
    pub socket_buffer_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], DEFAULT_UDP_PORT)),
            peer_address: SocketAddr::from(([127, 0, 0, 1], DEFAULT_UDP_PORT)),
            max_concealed_gap: 10,
            socket_buffer_size: 256 * 1024,
        }
    }
}

impl AppConfig {
    /// Default location of the config file
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "sdr-opus-audio")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from `path`, or from the default location when `None`
    ///
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)?;
        let config = Self::from_toml(&text)?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        self.wire.validate()?;
        if self.capture.block_frames == 0 || self.capture.ring_slots < 2 {
            return Err(Error::Config(
                "capture needs a non-empty block and at least two ring slots".into(),
            ));
        }
        if self.playback.prefill_frames >= self.playback.ring_frames {
            return Err(Error::Config(format!(
                "prefill of {} frames does not fit a ring of {} frames",
                self.playback.prefill_frames, self.playback.ring_frames
            )));
        }
        if self.opus.max_packet_size == 0 || self.opus.packet_loss_perc > 100 {
            return Err(Error::Config("invalid Opus packet settings".into()));
        }
        Ok(())
    }
}
