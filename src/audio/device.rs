//! Audio device enumeration
//!
//! Devices are identified by `input:<name>` / `output:<name>` ids so a
//! device that is both input and output appears once per direction.

use cpal::traits::{DeviceTrait, HostTrait};
use serde::{Deserialize, Serialize};

use crate::audio::convert::{SampleFormat, StreamFormat};
use crate::error::AudioError;

/// Which way audio flows through a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    fn prefix(self) -> &'static str {
        match self {
            Direction::Input => "input:",
            Direction::Output => "output:",
        }
    }
}

/// A device selected for a pipeline, with its native stream format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceBinding {
    pub id: String,
    pub name: String,
    pub direction: Direction,
    pub is_default: bool,
    pub format: StreamFormat,
}

impl DeviceBinding {
    pub fn new(name: &str, direction: Direction, format: StreamFormat) -> Self {
        Self {
            id: device_id(direction, name),
            name: name.to_string(),
            direction,
            is_default: false,
            format,
        }
    }

    pub fn is_input(&self) -> bool {
        self.direction == Direction::Input
    }

    pub fn is_output(&self) -> bool {
        self.direction == Direction::Output
    }
}

pub fn device_id(direction: Direction, name: &str) -> String {
    format!("{}{}", direction.prefix(), name)
}

/// Split an id into direction and device name
///
/// Ids without a prefix are taken as input device names.
pub fn parse_device_id(id: &str) -> (Direction, &str) {
    if let Some(name) = id.strip_prefix(Direction::Input.prefix()) {
        (Direction::Input, name)
    } else if let Some(name) = id.strip_prefix(Direction::Output.prefix()) {
        (Direction::Output, name)
    } else {
        (Direction::Input, id)
    }
}

pub(crate) fn sample_format_from_cpal(format: cpal::SampleFormat) -> Option<SampleFormat> {
    match format {
        cpal::SampleFormat::F32 => Some(SampleFormat::F32),
        cpal::SampleFormat::I16 => Some(SampleFormat::I16),
        cpal::SampleFormat::I32 => Some(SampleFormat::I32),
        _ => None,
    }
}

fn native_format(device: &cpal::Device, direction: Direction) -> Result<StreamFormat, AudioError> {
    let config = match direction {
        Direction::Input => device.default_input_config(),
        Direction::Output => device.default_output_config(),
    }
    .map_err(|e| AudioError::InvalidDevice(e.to_string()))?;

    let sample_format = sample_format_from_cpal(config.sample_format())
        .ok_or_else(|| AudioError::UnsupportedFormat(format!("{:?}", config.sample_format())))?;

    Ok(StreamFormat {
        sample_rate: config.sample_rate().0,
        channels: config.channels(),
        sample_format,
        // cpal always delivers interleaved buffers
        interleaved: true,
    })
}

fn binding_for(device: &cpal::Device, direction: Direction, default_name: Option<&str>) -> Result<DeviceBinding, AudioError> {
    let name = device
        .name()
        .map_err(|e| AudioError::InvalidDevice(e.to_string()))?;
    let format = native_format(device, direction)?;
    Ok(DeviceBinding {
        id: device_id(direction, &name),
        is_default: default_name == Some(name.as_str()),
        name,
        direction,
        format,
    })
}

fn host_devices(host: &cpal::Host, direction: Direction) -> Vec<cpal::Device> {
    let devices = match direction {
        Direction::Input => host.input_devices().map(|d| d.collect()),
        Direction::Output => host.output_devices().map(|d| d.collect()),
    };
    devices.unwrap_or_else(|e| {
        tracing::warn!("Failed to enumerate {:?} devices: {}", direction, e);
        Vec::new()
    })
}

fn default_device(host: &cpal::Host, direction: Direction) -> Option<cpal::Device> {
    match direction {
        Direction::Input => host.default_input_device(),
        Direction::Output => host.default_output_device(),
    }
}

/// List devices for one direction
pub fn devices(direction: Direction) -> Vec<DeviceBinding> {
    let host = cpal::default_host();
    let default_name = default_device(&host, direction).and_then(|d| d.name().ok());

    host_devices(&host, direction)
        .iter()
        .filter_map(|device| match binding_for(device, direction, default_name.as_deref()) {
            Ok(binding) => Some(binding),
            Err(e) => {
                tracing::debug!("Skipping {:?} device: {}", direction, e);
                None
            }
        })
        .collect()
}

pub fn input_devices() -> Vec<DeviceBinding> {
    devices(Direction::Input)
}

pub fn output_devices() -> Vec<DeviceBinding> {
    devices(Direction::Output)
}

/// List all available audio devices, inputs first
pub fn list_devices() -> Vec<DeviceBinding> {
    let mut all = input_devices();
    all.extend(output_devices());
    all
}

/// Look up a device by id
pub fn find_device(id: &str) -> Result<DeviceBinding, AudioError> {
    let (direction, name) = parse_device_id(id);
    let host = cpal::default_host();
    let default_name = default_device(&host, direction).and_then(|d| d.name().ok());

    host_devices(&host, direction)
        .iter()
        .find(|device| device.name().map(|n| n == name).unwrap_or(false))
        .ok_or_else(|| AudioError::DeviceNotFound(id.to_string()))
        .and_then(|device| binding_for(device, direction, default_name.as_deref()))
}

/// Resolve a configured device, falling back to the system default
pub fn resolve_device(id: Option<&str>, direction: Direction) -> Result<DeviceBinding, AudioError> {
    match id {
        Some(id) => find_device(id),
        None => default_binding(direction),
    }
}

fn default_binding(direction: Direction) -> Result<DeviceBinding, AudioError> {
    let host = cpal::default_host();
    let device = default_device(&host, direction)
        .ok_or_else(|| AudioError::DeviceNotFound(format!("No default {:?} device", direction)))?;
    let name = device.name().ok();
    binding_for(&device, direction, name.as_deref())
}

/// Get default input device
pub fn default_input() -> Result<DeviceBinding, AudioError> {
    default_binding(Direction::Input)
}

/// Get default output device
pub fn default_output() -> Result<DeviceBinding, AudioError> {
    default_binding(Direction::Output)
}

/// Find the cpal device behind a binding
pub(crate) fn cpal_device(binding: &DeviceBinding) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();
    host_devices(&host, binding.direction)
        .into_iter()
        .find(|device| device.name().map(|n| n == binding.name).unwrap_or(false))
        .ok_or_else(|| AudioError::DeviceNotFound(binding.id.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_ids() {
        assert_eq!(device_id(Direction::Input, "Mic"), "input:Mic");
        assert_eq!(parse_device_id("output:Speakers"), (Direction::Output, "Speakers"));
        assert_eq!(parse_device_id("input:Mic"), (Direction::Input, "Mic"));
        // Bare names are inputs
        assert_eq!(parse_device_id("Mic"), (Direction::Input, "Mic"));
    }

    #[test]
    fn test_binding_direction() {
        let format = StreamFormat {
            sample_rate: 48_000,
            channels: 2,
            sample_format: SampleFormat::F32,
            interleaved: true,
        };
        let binding = DeviceBinding::new("Speakers", Direction::Output, format);
        assert_eq!(binding.id, "output:Speakers");
        assert!(binding.is_output());
        assert!(!binding.is_input());
    }

    #[test]
    fn test_listed_devices_match_direction() {
        // Hosts without audio hardware list nothing
        for device in list_devices() {
            assert!(device.id.starts_with(device.direction.prefix()));
            assert!(device.format.channels > 0);
        }
    }
}
