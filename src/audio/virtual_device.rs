//! In-process audio hardware
//!
//! Streams built on a [`VirtualBackend`] are driven by whoever holds a
//! clone of the backend: `push_input` plays the role of the capture
//! interrupt and `pull_output` the role of the render interrupt. Used for
//! headless runs and the pipeline tests.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::audio::backend::{AudioBackend, ErrorCallback, HardwareStream, InputCallback, OutputCallback};
use crate::audio::convert::{SampleFormat, SourceBuffer, StreamFormat};
use crate::audio::device::{DeviceBinding, Direction};
use crate::error::AudioError;

enum Callback {
    Input(InputCallback),
    Output(OutputCallback),
}

struct Endpoint {
    id: u64,
    device_id: String,
    playing: bool,
    lost: bool,
    callback: Callback,
    on_error: ErrorCallback,
}

#[derive(Default)]
struct VirtualHardware {
    endpoints: Vec<Endpoint>,
    next_id: u64,
    fail_builds: bool,
    stall_next_build: Option<Duration>,
    unplugged: HashSet<String>,
}

impl VirtualHardware {
    fn live(&mut self) -> impl Iterator<Item = &mut Endpoint> {
        self.endpoints.iter_mut().filter(|e| e.playing && !e.lost)
    }
}

/// Backend whose devices exist only in memory
#[derive(Clone, Default)]
pub struct VirtualBackend {
    hardware: Arc<Mutex<VirtualHardware>>,
}

impl VirtualBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A binding for an f32 input device of the given shape
    pub fn input_device(name: &str, sample_rate: u32, channels: u16) -> DeviceBinding {
        DeviceBinding::new(name, Direction::Input, f32_format(sample_rate, channels))
    }

    /// A binding for an f32 output device of the given shape
    pub fn output_device(name: &str, sample_rate: u32, channels: u16) -> DeviceBinding {
        DeviceBinding::new(name, Direction::Output, f32_format(sample_rate, channels))
    }

    /// Deliver captured audio to every playing input stream
    ///
    /// Returns the number of streams that received it.
    pub fn push_input(&self, buffer: SourceBuffer<'_>) -> usize {
        let mut hardware = self.hardware.lock();
        let mut delivered = 0;
        for endpoint in hardware.live() {
            if let Callback::Input(on_data) = &mut endpoint.callback {
                on_data(buffer);
                delivered += 1;
            }
        }
        delivered
    }

    /// Ask the first playing output stream to render into `out`
    ///
    /// Returns false, leaving `out` untouched, when no output is playing.
    pub fn pull_output(&self, out: &mut [f32]) -> bool {
        let mut hardware = self.hardware.lock();
        for endpoint in hardware.live() {
            if let Callback::Output(on_data) = &mut endpoint.callback {
                on_data(out);
                return true;
            }
        }
        false
    }

    /// Unplug a device: its streams fault with `DeviceLost` and it can no
    /// longer be opened until `reconnect`
    pub fn disconnect(&self, device_id: &str) {
        let mut hardware = self.hardware.lock();
        hardware.unplugged.insert(device_id.to_string());
        for endpoint in hardware.endpoints.iter_mut().filter(|e| e.device_id == device_id) {
            if !endpoint.lost {
                endpoint.lost = true;
                (endpoint.on_error)(AudioError::DeviceLost(device_id.to_string()));
            }
        }
    }

    pub fn reconnect(&self, device_id: &str) {
        self.hardware.lock().unplugged.remove(device_id);
    }

    /// Make subsequent stream builds fail
    pub fn set_fail_builds(&self, fail: bool) {
        self.hardware.lock().fail_builds = fail;
    }

    /// Make the next stream build block for `delay` before opening
    pub fn stall_next_build(&self, delay: Duration) {
        self.hardware.lock().stall_next_build = Some(delay);
    }

    /// Open input streams, playing or not
    pub fn input_streams(&self) -> usize {
        self.count(|c| matches!(c, Callback::Input(_)))
    }

    /// Open output streams, playing or not
    pub fn output_streams(&self) -> usize {
        self.count(|c| matches!(c, Callback::Output(_)))
    }

    fn count(&self, predicate: impl Fn(&Callback) -> bool) -> usize {
        self.hardware
            .lock()
            .endpoints
            .iter()
            .filter(|e| predicate(&e.callback))
            .count()
    }

    fn open(
        &self,
        binding: &DeviceBinding,
        direction: Direction,
        callback: Callback,
        on_error: ErrorCallback,
    ) -> Result<Box<dyn HardwareStream>, AudioError> {
        if binding.direction != direction {
            return Err(AudioError::InvalidDevice(binding.id.clone()));
        }
        let stall = self.hardware.lock().stall_next_build.take();
        if let Some(delay) = stall {
            thread::sleep(delay);
        }
        let mut hardware = self.hardware.lock();
        if hardware.fail_builds {
            return Err(AudioError::StreamError(format!("{} refused to open", binding.id)));
        }
        if hardware.unplugged.contains(&binding.id) {
            return Err(AudioError::DeviceNotFound(binding.id.clone()));
        }

        let id = hardware.next_id;
        hardware.next_id += 1;
        hardware.endpoints.push(Endpoint {
            id,
            device_id: binding.id.clone(),
            playing: false,
            lost: false,
            callback,
            on_error,
        });
        tracing::trace!(device = %binding.id, id, "Opened virtual stream");

        Ok(Box::new(VirtualStream {
            hardware: self.hardware.clone(),
            id,
        }))
    }
}

impl AudioBackend for VirtualBackend {
    fn build_input(
        &self,
        device: &DeviceBinding,
        on_data: InputCallback,
        on_error: ErrorCallback,
    ) -> Result<Box<dyn HardwareStream>, AudioError> {
        self.open(device, Direction::Input, Callback::Input(on_data), on_error)
    }

    fn build_output(
        &self,
        device: &DeviceBinding,
        on_data: OutputCallback,
        on_error: ErrorCallback,
    ) -> Result<Box<dyn HardwareStream>, AudioError> {
        self.open(device, Direction::Output, Callback::Output(on_data), on_error)
    }
}

struct VirtualStream {
    hardware: Arc<Mutex<VirtualHardware>>,
    id: u64,
}

impl HardwareStream for VirtualStream {
    fn play(&self) -> Result<(), AudioError> {
        let mut hardware = self.hardware.lock();
        match hardware.endpoints.iter_mut().find(|e| e.id == self.id) {
            Some(endpoint) if !endpoint.lost => {
                endpoint.playing = true;
                Ok(())
            }
            Some(endpoint) => Err(AudioError::DeviceLost(endpoint.device_id.clone())),
            None => Err(AudioError::StreamError("stream already closed".into())),
        }
    }
}

impl Drop for VirtualStream {
    fn drop(&mut self) {
        self.hardware.lock().endpoints.retain(|e| e.id != self.id);
    }
}

fn f32_format(sample_rate: u32, channels: u16) -> StreamFormat {
    StreamFormat {
        sample_rate,
        channels,
        sample_format: SampleFormat::F32,
        interleaved: true,
    }
}
