//! Hardware abstraction for the pipelines
//!
//! A backend opens input and output streams on a [`DeviceBinding`] and
//! calls back into the pipeline from its realtime thread. Dropping the
//! returned stream halts the hardware.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample, StreamConfig};

use crate::audio::convert::{SampleFormat, SourceBuffer};
use crate::audio::device::{cpal_device, DeviceBinding};
use crate::error::AudioError;

/// Receives captured audio in the device's native format
pub type InputCallback = Box<dyn FnMut(SourceBuffer<'_>) + Send>;

/// Fills an interleaved `f32` buffer at the device's rate and channel count
pub type OutputCallback = Box<dyn FnMut(&mut [f32]) + Send>;

/// Called from the hardware thread when the stream faults
pub type ErrorCallback = Box<dyn FnMut(AudioError) + Send>;

/// A built hardware stream; stops when dropped
pub trait HardwareStream {
    fn play(&self) -> Result<(), AudioError>;
}

/// Source of hardware streams
pub trait AudioBackend: Send + Sync {
    fn build_input(
        &self,
        device: &DeviceBinding,
        on_data: InputCallback,
        on_error: ErrorCallback,
    ) -> Result<Box<dyn HardwareStream>, AudioError>;

    fn build_output(
        &self,
        device: &DeviceBinding,
        on_data: OutputCallback,
        on_error: ErrorCallback,
    ) -> Result<Box<dyn HardwareStream>, AudioError>;
}

/// Backend over the system's default cpal host
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

struct CpalStream(cpal::Stream);

impl HardwareStream for CpalStream {
    fn play(&self) -> Result<(), AudioError> {
        self.0
            .play()
            .map_err(|e| AudioError::StreamError(e.to_string()))
    }
}

/// Output buffers larger than this are rare; the scratch grows if needed
const OUTPUT_SCRATCH_SAMPLES: usize = 8192;

fn stream_config(device: &DeviceBinding) -> StreamConfig {
    StreamConfig {
        channels: device.format.channels,
        sample_rate: cpal::SampleRate(device.format.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    }
}

fn error_handler(device_id: String, mut on_error: ErrorCallback) -> impl FnMut(cpal::StreamError) + Send + 'static {
    move |err| {
        let error = match err {
            cpal::StreamError::DeviceNotAvailable => AudioError::DeviceLost(device_id.clone()),
            other => AudioError::StreamError(other.to_string()),
        };
        on_error(error);
    }
}

fn map_build_error(device: &DeviceBinding, err: cpal::BuildStreamError) -> AudioError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => AudioError::DeviceLost(device.id.clone()),
        cpal::BuildStreamError::StreamConfigNotSupported => {
            AudioError::UnsupportedFormat(format!("{:?} on {}", device.format, device.id))
        }
        other => AudioError::StreamError(other.to_string()),
    }
}

/// Output stream for integer devices, rendered in `f32` and converted
fn build_converting_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut on_data: OutputCallback,
    on_error: impl FnMut(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample + FromSample<f32>,
{
    let mut scratch: Vec<f32> = Vec::with_capacity(OUTPUT_SCRATCH_SAMPLES);
    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            scratch.resize(data.len(), 0.0);
            on_data(&mut scratch);
            for (out, sample) in data.iter_mut().zip(&scratch) {
                *out = sample.to_sample::<T>();
            }
        },
        on_error,
        None,
    )
}

impl AudioBackend for CpalBackend {
    fn build_input(
        &self,
        binding: &DeviceBinding,
        mut on_data: InputCallback,
        on_error: ErrorCallback,
    ) -> Result<Box<dyn HardwareStream>, AudioError> {
        if !binding.is_input() {
            return Err(AudioError::InvalidDevice(binding.id.clone()));
        }
        let device = cpal_device(binding)?;
        let config = stream_config(binding);
        let err_fn = error_handler(binding.id.clone(), on_error);

        let stream = match binding.format.sample_format {
            SampleFormat::F32 => device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| on_data(SourceBuffer::F32(data)),
                err_fn,
                None,
            ),
            SampleFormat::I16 => device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| on_data(SourceBuffer::I16(data)),
                err_fn,
                None,
            ),
            SampleFormat::I32 => device.build_input_stream(
                &config,
                move |data: &[i32], _: &cpal::InputCallbackInfo| on_data(SourceBuffer::I32(data)),
                err_fn,
                None,
            ),
        }
        .map_err(|e| map_build_error(binding, e))?;

        tracing::debug!(device = %binding.id, ?config, "Built input stream");
        Ok(Box::new(CpalStream(stream)))
    }

    fn build_output(
        &self,
        binding: &DeviceBinding,
        mut on_data: OutputCallback,
        on_error: ErrorCallback,
    ) -> Result<Box<dyn HardwareStream>, AudioError> {
        if !binding.is_output() {
            return Err(AudioError::InvalidDevice(binding.id.clone()));
        }
        let device = cpal_device(binding)?;
        let config = stream_config(binding);
        let err_fn = error_handler(binding.id.clone(), on_error);

        let stream = match binding.format.sample_format {
            SampleFormat::F32 => device.build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| on_data(data),
                err_fn,
                None,
            ),
            SampleFormat::I16 => build_converting_output::<i16>(&device, &config, on_data, err_fn),
            SampleFormat::I32 => build_converting_output::<i32>(&device, &config, on_data, err_fn),
        }
        .map_err(|e| map_build_error(binding, e))?;

        tracing::debug!(device = %binding.id, ?config, "Built output stream");
        Ok(Box::new(CpalStream(stream)))
    }
}
