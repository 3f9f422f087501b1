//! Opus decoder wrapper
//!
//! Decodes one wire frame per call straight into the caller's buffer. Lost
//! frames go through Opus packet loss concealment so the output clock never
//! skips.

use opus::Decoder;

use crate::codec::encoder::opus_channels;
use crate::config::WireFormat;
use crate::error::CodecError;

/// One frame as delivered by the radio's audio stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressedFrame<'a> {
    /// An encoded Opus packet
    Data(&'a [u8]),
    /// The frame never arrived
    Lost,
}

impl<'a> CompressedFrame<'a> {
    /// Interpret a stream payload; a zero sample count or empty payload marks a lost frame
    pub fn from_wire(payload: &'a [u8], sample_count: usize) -> Self {
        if sample_count == 0 || payload.is_empty() {
            CompressedFrame::Lost
        } else {
            CompressedFrame::Data(payload)
        }
    }

    pub fn is_lost(&self) -> bool {
        matches!(self, CompressedFrame::Lost)
    }
}

/// Opus decoder wrapper
pub struct OpusDecoder {
    decoder: Decoder,
    wire: WireFormat,
    frames_decoded: u64,
    /// Frames synthesized by packet loss concealment
    frames_concealed: u64,
    decode_errors: u64,
}

impl OpusDecoder {
    pub fn new(wire: &WireFormat) -> Result<Self, CodecError> {
        let channels = opus_channels(wire.channels)
            .ok_or_else(|| CodecError::DecoderInit(format!("Unsupported channel count: {}", wire.channels)))?;

        let decoder = Decoder::new(wire.sample_rate, channels)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;

        Ok(Self {
            decoder,
            wire: *wire,
            frames_decoded: 0,
            frames_concealed: 0,
            decode_errors: 0,
        })
    }

    /// Decode one frame into `out`
    ///
    /// `out` must hold exactly one wire frame of interleaved samples. It is
    /// always fully written: on error it is left silent, and a packet shorter
    /// than a frame is padded with silence. Returns samples per channel
    /// produced by the codec.
    pub fn decode(&mut self, frame: CompressedFrame<'_>, out: &mut [f32]) -> Result<usize, CodecError> {
        if out.len() != self.wire.samples_per_frame() {
            out.fill(0.0);
            return Err(CodecError::InvalidFrameSize(out.len()));
        }

        let (payload, concealed): (&[u8], bool) = match frame {
            CompressedFrame::Data(data) => (data, false),
            CompressedFrame::Lost => (&[], true),
        };

        match self.decoder.decode_float(payload, out, false) {
            Ok(frames) => {
                let written = frames * self.wire.channels as usize;
                let out_len = out.len();
                out[written.min(out_len)..].fill(0.0);
                if concealed {
                    self.frames_concealed += 1;
                } else {
                    self.frames_decoded += 1;
                }
                Ok(frames)
            }
            Err(e) => {
                out.fill(0.0);
                self.decode_errors += 1;
                Err(CodecError::DecodingFailed(e.to_string()))
            }
        }
    }

    /// Reset decoder state
    pub fn reset(&mut self) -> Result<(), CodecError> {
        self.decoder
            .reset_state()
            .map_err(|e| CodecError::DecoderInit(e.to_string()))
    }

    pub fn wire_format(&self) -> &WireFormat {
        &self.wire
    }

    /// Get frame size in samples (per channel)
    pub fn frame_size(&self) -> usize {
        self.wire.frame_size
    }

    pub fn samples_per_frame(&self) -> usize {
        self.wire.samples_per_frame()
    }

    pub fn stats(&self) -> DecoderStats {
        let total = self.frames_decoded + self.frames_concealed;
        DecoderStats {
            frames_decoded: self.frames_decoded,
            frames_concealed: self.frames_concealed,
            decode_errors: self.decode_errors,
            loss_rate: if total > 0 {
                self.frames_concealed as f32 / total as f32
            } else {
                0.0
            },
        }
    }

    pub fn reset_stats(&mut self) {
        self.frames_decoded = 0;
        self.frames_concealed = 0;
        self.decode_errors = 0;
    }
}

/// Decoder statistics
#[derive(Debug, Clone, Default)]
pub struct DecoderStats {
    pub frames_decoded: u64,
    pub frames_concealed: u64,
    pub decode_errors: u64,
    pub loss_rate: f32,
}
