//! Network subsystem for UDP audio transport

pub mod udp;

pub use udp::{create_socket, AudioPacket, SequenceTracker, UdpAudioReceiver, UdpAudioSink};
