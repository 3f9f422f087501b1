//! Opus encoder for the transmit path
//!
//! One wire frame in, one Opus packet out. The packet borrows the encoder's
//! scratch so the capture worker never allocates per frame.

use opus::{Application, Bitrate, Channels, Encoder};

use crate::config::{OpusApplication, OpusConfig, WireFormat};
use crate::error::CodecError;

pub struct OpusEncoder {
    encoder: Encoder,
    wire: WireFormat,
    config: OpusConfig,
    packet: Vec<u8>,
    stats: EncoderStats,
}

/// Running totals since creation or the last `reset_stats`
#[derive(Debug, Clone, Copy, Default)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    pub payload_bytes: u64,
    pub largest_packet: usize,
}

impl EncoderStats {
    pub fn mean_packet_bytes(&self) -> f32 {
        match self.frames_encoded {
            0 => 0.0,
            n => self.payload_bytes as f32 / n as f32,
        }
    }
}

impl From<OpusApplication> for Application {
    fn from(app: OpusApplication) -> Self {
        match app {
            OpusApplication::Voip => Application::Voip,
            OpusApplication::Audio => Application::Audio,
            OpusApplication::LowDelay => Application::LowDelay,
        }
    }
}

fn setting(what: &str, result: opus::Result<()>) -> Result<(), CodecError> {
    result.map_err(|e| CodecError::EncoderInit(format!("{what}: {e}")))
}

impl OpusEncoder {
    pub fn new(wire: &WireFormat, config: &OpusConfig) -> Result<Self, CodecError> {
        let channels = opus_channels(wire.channels)
            .ok_or_else(|| CodecError::EncoderInit(format!("{} channels not supported", wire.channels)))?;
        let mut encoder = Encoder::new(wire.sample_rate, channels, config.application.into())
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;
        apply_settings(&mut encoder, config)?;

        tracing::debug!(
            rate = wire.sample_rate,
            channels = wire.channels,
            bitrate = config.bitrate,
            "Opus encoder ready"
        );
        Ok(Self {
            encoder,
            wire: *wire,
            config: config.clone(),
            packet: vec![0; config.max_packet_size],
            stats: EncoderStats::default(),
        })
    }

    /// Encode one interleaved frame of exactly `samples_per_frame` values
    ///
    /// The packet is only valid until the next call.
    pub fn encode(&mut self, pcm: &[f32]) -> Result<&[u8], CodecError> {
        if pcm.len() != self.wire.samples_per_frame() {
            return Err(CodecError::InvalidFrameSize(pcm.len()));
        }
        let len = self
            .encoder
            .encode_float(pcm, &mut self.packet)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        self.stats.frames_encoded += 1;
        self.stats.payload_bytes += len as u64;
        self.stats.largest_packet = self.stats.largest_packet.max(len);
        Ok(&self.packet[..len])
    }

    pub fn set_bitrate(&mut self, bitrate: u32) -> Result<(), CodecError> {
        setting("bitrate", self.encoder.set_bitrate(Bitrate::Bits(bitrate as i32)))?;
        self.config.bitrate = bitrate;
        Ok(())
    }

    /// Forget the signal history, e.g. after a gap in capture
    pub fn reset(&mut self) -> Result<(), CodecError> {
        setting("reset", self.encoder.reset_state())
    }

    pub fn config(&self) -> &OpusConfig {
        &self.config
    }

    pub fn wire_format(&self) -> &WireFormat {
        &self.wire
    }

    pub fn frame_size(&self) -> usize {
        self.wire.frame_size
    }

    pub fn samples_per_frame(&self) -> usize {
        self.wire.samples_per_frame()
    }

    pub fn stats(&self) -> EncoderStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = EncoderStats::default();
    }
}

fn apply_settings(encoder: &mut Encoder, config: &OpusConfig) -> Result<(), CodecError> {
    setting("bitrate", encoder.set_bitrate(Bitrate::Bits(config.bitrate as i32)))?;
    setting("vbr", encoder.set_vbr(config.vbr))?;
    if config.vbr {
        setting("vbr constraint", encoder.set_vbr_constraint(config.cvbr))?;
    }
    setting("inband fec", encoder.set_inband_fec(config.fec))?;
    if config.fec {
        setting("packet loss", encoder.set_packet_loss_perc(config.packet_loss_perc as i32))?;
    }
    Ok(())
}

pub(crate) fn opus_channels(channels: u16) -> Option<Channels> {
    match channels {
        1 => Some(Channels::Mono),
        2 => Some(Channels::Stereo),
        _ => None,
    }
}
