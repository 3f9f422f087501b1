//! Opus codec wrapper
//!
//! Encoder and decoder agree on a fixed [`WireFormat`](crate::config::WireFormat);
//! both work on one frame at a time.

pub mod decoder;
pub mod encoder;

pub use decoder::{CompressedFrame, DecoderStats, OpusDecoder};
pub use encoder::{EncoderStats, OpusEncoder};
