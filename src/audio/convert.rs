//! Sample format, channel layout and sample rate conversion
//!
//! The converter works in the pull style of a hardware converter unit:
//! `convert` asks its input closure for source audio until it can emit one
//! fixed-size output block. Input that is handed over but not yet consumed
//! stays buffered inside the converter, so callers never track resampler
//! state themselves.

use cpal::Sample;
use rubato::{FftFixedOut, Resampler};
use serde::{Deserialize, Serialize};

use crate::config::WireFormat;
use crate::error::ConvertError;

/// Sample encodings the converter understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    I16,
    I32,
    F32,
}

/// A stream's native format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
    pub interleaved: bool,
}

impl StreamFormat {
    /// Interleaved `f32` at the wire rate and channel count
    pub fn intermediate(wire: &WireFormat) -> Self {
        Self {
            sample_rate: wire.sample_rate,
            channels: wire.channels,
            sample_format: SampleFormat::F32,
            interleaved: true,
        }
    }

    /// Same rate and channel count; sample encoding is not compared
    pub fn same_shape(&self, other: &StreamFormat) -> bool {
        self.sample_rate == other.sample_rate && self.channels == other.channels
    }
}

/// Borrowed source audio in one of the supported layouts
#[derive(Debug, Clone, Copy)]
pub enum SourceBuffer<'a> {
    F32(&'a [f32]),
    I16(&'a [i16]),
    I32(&'a [i32]),
    /// One slice per channel
    PlanarF32(&'a [&'a [f32]]),
}

impl<'a> SourceBuffer<'a> {
    /// Frames held, given the stream's channel count
    pub fn frames(&self, channels: usize) -> usize {
        match self {
            SourceBuffer::F32(d) => d.len() / channels,
            SourceBuffer::I16(d) => d.len() / channels,
            SourceBuffer::I32(d) => d.len() / channels,
            SourceBuffer::PlanarF32(p) => p.first().map_or(0, |c| c.len()),
        }
    }

    #[inline]
    fn sample(&self, frame: usize, channel: usize, channels: usize) -> f32 {
        match self {
            SourceBuffer::F32(d) => d[frame * channels + channel],
            SourceBuffer::I16(d) => d[frame * channels + channel].to_sample::<f32>(),
            SourceBuffer::I32(d) => d[frame * channels + channel].to_sample::<f32>(),
            SourceBuffer::PlanarF32(p) => p[channel][frame],
        }
    }

    fn check_layout(&self, channels: usize) -> Result<(), ConvertError> {
        match self {
            SourceBuffer::PlanarF32(p) => {
                if p.len() != channels {
                    return Err(ConvertError::ChannelMismatch {
                        expected: channels,
                        actual: p.len(),
                    });
                }
                let frames = self.frames(channels);
                if p.iter().any(|c| c.len() != frames) {
                    return Err(ConvertError::UnsupportedLayout(
                        "planar channels differ in length".into(),
                    ));
                }
            }
            SourceBuffer::F32(d) => Self::check_interleaved(d.len(), channels)?,
            SourceBuffer::I16(d) => Self::check_interleaved(d.len(), channels)?,
            SourceBuffer::I32(d) => Self::check_interleaved(d.len(), channels)?,
        }
        Ok(())
    }

    fn check_interleaved(len: usize, channels: usize) -> Result<(), ConvertError> {
        if len % channels != 0 {
            return Err(ConvertError::ChannelMismatch {
                expected: channels,
                actual: len % channels,
            });
        }
        Ok(())
    }
}

/// Answer of the input closure
pub enum InputStatus<'a> {
    HaveData(SourceBuffer<'a>),
    /// Nothing more right now; pending input is kept for the next call
    NoDataNow,
    /// Source finished; pending input is padded with silence and flushed
    EndOfStream,
}

/// Outcome of one `convert` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvertStatus {
    /// A full output block was written
    HaveData,
    /// Input ran dry before a block was complete; output untouched
    InputRanDry,
    /// Input ended and nothing is pending; output untouched
    EndOfStream,
}

/// Converts a native stream into fixed-size interleaved `f32` blocks
pub struct FormatConverter {
    source: StreamFormat,
    destination: StreamFormat,
    block_frames: usize,
    resampler: Option<FftFixedOut<f32>>,
    /// Planar input at the destination channel count, source rate
    pending: Vec<Vec<f32>>,
    resampler_in: Vec<Vec<f32>>,
    resampler_out: Vec<Vec<f32>>,
}

impl FormatConverter {
    pub fn new(
        source: StreamFormat,
        destination: StreamFormat,
        block_frames: usize,
    ) -> Result<Self, ConvertError> {
        if destination.sample_format != SampleFormat::F32 || !destination.interleaved {
            return Err(ConvertError::UnsupportedLayout(
                "destination must be interleaved f32".into(),
            ));
        }
        if source.channels == 0 || destination.channels == 0 || block_frames == 0 {
            return Err(ConvertError::UnsupportedLayout(format!(
                "{} -> {} channels, block of {block_frames} frames",
                source.channels, destination.channels
            )));
        }
        if source.sample_rate == 0 || destination.sample_rate == 0 {
            return Err(ConvertError::UnsupportedLayout("zero sample rate".into()));
        }

        let channels = destination.channels as usize;
        let resampler = if source.sample_rate != destination.sample_rate {
            Some(FftFixedOut::<f32>::new(
                source.sample_rate as usize,
                destination.sample_rate as usize,
                block_frames,
                1,
                channels,
            )?)
        } else {
            None
        };

        let (resampler_in, resampler_out, input_max) = match &resampler {
            Some(r) => (
                r.input_buffer_allocate(true),
                r.output_buffer_allocate(true),
                r.input_frames_max(),
            ),
            None => (Vec::new(), Vec::new(), block_frames),
        };

        // Room for a full resampler chunk plus a generous hardware buffer
        let pending_capacity = input_max + source.sample_rate as usize / 5;
        let pending = (0..channels)
            .map(|_| Vec::with_capacity(pending_capacity))
            .collect();

        Ok(Self {
            source,
            destination,
            block_frames,
            resampler,
            pending,
            resampler_in,
            resampler_out,
        })
    }

    pub fn source(&self) -> &StreamFormat {
        &self.source
    }

    pub fn destination(&self) -> &StreamFormat {
        &self.destination
    }

    /// Output frames produced per successful `convert`
    pub fn block_frames(&self) -> usize {
        self.block_frames
    }

    /// Interleaved samples in one output block
    pub fn block_samples(&self) -> usize {
        self.block_frames * self.destination.channels as usize
    }

    /// Source frames still missing before the next block can be produced
    pub fn input_frames_needed(&self) -> usize {
        self.chunk_frames().saturating_sub(self.pending_frames())
    }

    /// Upper bound of `input_frames_needed`
    pub fn input_frames_max(&self) -> usize {
        match &self.resampler {
            Some(r) => r.input_frames_max(),
            None => self.block_frames,
        }
    }

    /// Source frames buffered but not yet converted
    pub fn pending_frames(&self) -> usize {
        self.pending.first().map_or(0, Vec::len)
    }

    /// Drop buffered input and resampler history
    pub fn reset(&mut self) {
        for channel in &mut self.pending {
            channel.clear();
        }
        if let Some(resampler) = &mut self.resampler {
            resampler.reset();
        }
    }

    fn chunk_frames(&self) -> usize {
        match &self.resampler {
            Some(r) => r.input_frames_next(),
            None => self.block_frames,
        }
    }

    /// Produce one output block, pulling source audio through `input`
    pub fn convert<'a, F>(&mut self, output: &mut [f32], mut input: F) -> Result<ConvertStatus, ConvertError>
    where
        F: FnMut(usize) -> InputStatus<'a>,
    {
        let expected = self.block_samples();
        if output.len() != expected {
            return Err(ConvertError::OutputSize {
                expected,
                actual: output.len(),
            });
        }

        let needed = self.chunk_frames();
        while self.pending_frames() < needed {
            match input(needed - self.pending_frames()) {
                InputStatus::HaveData(buffer) => self.push_source(buffer)?,
                InputStatus::NoDataNow => return Ok(ConvertStatus::InputRanDry),
                InputStatus::EndOfStream => {
                    if self.pending_frames() == 0 {
                        return Ok(ConvertStatus::EndOfStream);
                    }
                    for channel in &mut self.pending {
                        channel.resize(needed, 0.0);
                    }
                }
            }
        }

        let channels = self.destination.channels as usize;
        match &mut self.resampler {
            Some(resampler) => {
                for (staged, pending) in self.resampler_in.iter_mut().zip(&self.pending) {
                    staged.clear();
                    staged.extend_from_slice(&pending[..needed]);
                }
                let (consumed, produced) =
                    resampler.process_into_buffer(&self.resampler_in, &mut self.resampler_out, None)?;
                for frame in 0..produced.min(self.block_frames) {
                    for ch in 0..channels {
                        output[frame * channels + ch] = self.resampler_out[ch][frame];
                    }
                }
                output[produced.min(self.block_frames) * channels..].fill(0.0);
                for channel in &mut self.pending {
                    channel.drain(..consumed.min(channel.len()));
                }
            }
            None => {
                for frame in 0..needed {
                    for ch in 0..channels {
                        output[frame * channels + ch] = self.pending[ch][frame];
                    }
                }
                for channel in &mut self.pending {
                    channel.drain(..needed);
                }
            }
        }
        Ok(ConvertStatus::HaveData)
    }

    /// Map source channels onto the destination layout and buffer them
    fn push_source(&mut self, buffer: SourceBuffer<'_>) -> Result<(), ConvertError> {
        let src_channels = self.source.channels as usize;
        let dst_channels = self.destination.channels as usize;
        if !self.source.interleaved && !matches!(buffer, SourceBuffer::PlanarF32(_)) {
            return Err(ConvertError::UnsupportedLayout(
                "interleaved buffer for a planar source".into(),
            ));
        }
        buffer.check_layout(src_channels)?;

        let frames = buffer.frames(src_channels);
        for frame in 0..frames {
            if dst_channels == src_channels {
                for ch in 0..dst_channels {
                    self.pending[ch].push(buffer.sample(frame, ch, src_channels));
                }
            } else if dst_channels == 1 {
                let sum: f32 = (0..src_channels)
                    .map(|ch| buffer.sample(frame, ch, src_channels))
                    .sum();
                self.pending[0].push(sum / src_channels as f32);
            } else {
                for ch in 0..dst_channels {
                    let value = buffer.sample(frame, ch % src_channels, src_channels);
                    self.pending[ch].push(value);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(sample_rate: u32, channels: u16) -> StreamFormat {
        StreamFormat {
            sample_rate,
            channels,
            sample_format: SampleFormat::F32,
            interleaved: true,
        }
    }

    /// Feed `buffer` once, then report no data
    fn once<'a>(buffer: SourceBuffer<'a>) -> impl FnMut(usize) -> InputStatus<'a> {
        let mut pending = Some(buffer);
        move |_| pending.take().map_or(InputStatus::NoDataNow, InputStatus::HaveData)
    }

    #[test]
    fn passthrough_when_formats_match() {
        let mut conv = FormatConverter::new(format(24_000, 2), format(24_000, 2), 2).unwrap();
        let input = [0.1, 0.2, 0.3, 0.4];
        let mut out = vec![0.0; 4];

        let status = conv.convert(&mut out, once(SourceBuffer::F32(&input))).unwrap();
        assert_eq!(status, ConvertStatus::HaveData);
        assert_eq!(out, input);
    }

    #[test]
    fn upmixes_mono_to_stereo() {
        let mut conv = FormatConverter::new(format(24_000, 1), format(24_000, 2), 2).unwrap();
        let mut out = vec![0.0; 4];
        conv.convert(&mut out, once(SourceBuffer::F32(&[0.25, -0.25]))).unwrap();
        assert_eq!(out, vec![0.25, 0.25, -0.25, -0.25]);
    }

    #[test]
    fn downmixes_stereo_to_mono() {
        let mut conv = FormatConverter::new(format(24_000, 2), format(24_000, 1), 2).unwrap();
        let mut out = vec![0.0; 2];
        conv.convert(&mut out, once(SourceBuffer::F32(&[1.0, 0.0, 0.5, -0.5])))
            .unwrap();
        assert_eq!(out, vec![0.5, 0.0]);
    }

    #[test]
    fn converts_integer_samples() {
        let mut conv = FormatConverter::new(format(24_000, 1), format(24_000, 1), 2).unwrap();
        let mut out = vec![1.0; 2];
        conv.convert(&mut out, once(SourceBuffer::I16(&[0, i16::MIN]))).unwrap();
        assert_eq!(out[0], 0.0);
        assert_eq!(out[1], -1.0);
    }

    #[test]
    fn interleaves_planar_sources() {
        let source = StreamFormat {
            interleaved: false,
            ..format(24_000, 2)
        };
        let mut conv = FormatConverter::new(source, format(24_000, 2), 2).unwrap();
        let left = [1.0, 2.0];
        let right = [-1.0, -2.0];
        let planes: [&[f32]; 2] = [&left, &right];
        let mut out = vec![0.0; 4];
        conv.convert(&mut out, once(SourceBuffer::PlanarF32(&planes))).unwrap();
        assert_eq!(out, vec![1.0, -1.0, 2.0, -2.0]);

        // An interleaved buffer does not fit a planar source
        assert!(conv.convert(&mut out, once(SourceBuffer::F32(&[0.0; 4]))).is_err());
    }

    #[test]
    fn buffers_partial_input_across_calls() {
        let mut conv = FormatConverter::new(format(24_000, 1), format(24_000, 1), 4).unwrap();
        let mut out = vec![0.0; 4];

        let status = conv.convert(&mut out, once(SourceBuffer::F32(&[1.0, 2.0, 3.0]))).unwrap();
        assert_eq!(status, ConvertStatus::InputRanDry);
        assert_eq!(conv.pending_frames(), 3);
        assert_eq!(conv.input_frames_needed(), 1);

        let status = conv.convert(&mut out, once(SourceBuffer::F32(&[4.0, 5.0]))).unwrap();
        assert_eq!(status, ConvertStatus::HaveData);
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(conv.pending_frames(), 1);
    }

    #[test]
    fn end_of_stream_flushes_with_silence() {
        let mut conv = FormatConverter::new(format(24_000, 1), format(24_000, 1), 4).unwrap();
        let mut out = vec![9.0; 4];
        let mut calls = 0;
        let status = conv
            .convert(&mut out, |_| {
                calls += 1;
                if calls == 1 {
                    InputStatus::HaveData(SourceBuffer::F32(&[1.0, 2.0]))
                } else {
                    InputStatus::EndOfStream
                }
            })
            .unwrap();
        assert_eq!(status, ConvertStatus::HaveData);
        assert_eq!(out, vec![1.0, 2.0, 0.0, 0.0]);

        let status = conv.convert(&mut out, |_| InputStatus::EndOfStream).unwrap();
        assert_eq!(status, ConvertStatus::EndOfStream);
    }

    #[test]
    fn reports_layout_errors() {
        let mut conv = FormatConverter::new(format(24_000, 2), format(24_000, 2), 2).unwrap();
        let mut out = vec![0.0; 4];
        let err = conv.convert(&mut out, once(SourceBuffer::F32(&[0.0; 3]))).unwrap_err();
        assert!(matches!(err, ConvertError::ChannelMismatch { .. }));

        let mut short = vec![0.0; 3];
        assert!(matches!(
            conv.convert(&mut short, |_| InputStatus::NoDataNow),
            Err(ConvertError::OutputSize { .. })
        ));

        let planar_dest = StreamFormat {
            interleaved: false,
            ..format(24_000, 2)
        };
        assert!(FormatConverter::new(format(24_000, 2), planar_dest, 2).is_err());
    }

    #[test]
    fn resamples_to_the_destination_rate() {
        let block = 240;
        let mut conv = FormatConverter::new(format(48_000, 1), format(24_000, 2), block).unwrap();
        let tone: Vec<f32> = (0..48_000)
            .map(|i| (i as f32 * 440.0 * std::f32::consts::TAU / 48_000.0).sin() * 0.5)
            .collect();

        let mut offset = 0;
        let mut produced = 0;
        let mut out = vec![0.0; block * 2];
        loop {
            let status = conv
                .convert(&mut out, |needed| {
                    if offset >= tone.len() {
                        return InputStatus::NoDataNow;
                    }
                    let end = (offset + needed).min(tone.len());
                    let chunk = &tone[offset..end];
                    offset = end;
                    InputStatus::HaveData(SourceBuffer::F32(chunk))
                })
                .unwrap();
            if status != ConvertStatus::HaveData {
                break;
            }
            produced += block;
            // Channels are duplicated from the mono source
            assert!(out.chunks_exact(2).all(|f| f[0] == f[1]));
        }

        // One second in, roughly one second out, minus what the resampler holds back
        assert!(produced <= 24_000, "produced {produced}");
        assert!(produced >= 24_000 - 2 * block, "produced {produced}");

        // The tone survives at its original level once the resampler has settled
        let peak = out.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(peak > 0.4 && peak < 0.6, "peak {peak}");
    }
}
