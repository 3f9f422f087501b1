//! Audio subsystem module

pub mod backend;
pub mod buffer;
pub mod capture;
pub mod convert;
pub mod device;
pub mod events;
mod holder;
pub mod playback;
pub mod virtual_device;

pub use backend::{AudioBackend, CpalBackend, HardwareStream};
pub use buffer::{RingBuffer, SharedRingBuffer};
pub use capture::{CapturePipeline, CaptureState, CaptureStats, EncodedAudioSink};
pub use convert::{FormatConverter, SampleFormat, SourceBuffer, StreamFormat};
pub use device::{list_devices, resolve_device, DeviceBinding, Direction};
pub use events::{EventHub, PipelineEvent, SubscriptionId};
pub use playback::{CompressedFrameHandler, PlaybackPipeline, PlaybackState, PlaybackStats};
pub use virtual_device::VirtualBackend;
