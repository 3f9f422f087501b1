//! UDP transport for Opus frames
//!
//! Packet layout, big-endian:
//!
//! ```text
//! ┌────────────┬──────────────┬─────────────────────┐
//! │ sequence   │ sample_count │ Opus payload        │
//! │ u32        │ u16          │ 0..n bytes          │
//! └────────────┴──────────────┴─────────────────────┘
//! ```
//!
//! A `sample_count` of zero marks a frame the sender knows to be missing.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::capture::EncodedAudioSink;
use crate::audio::playback::CompressedFrameHandler;
use crate::codec::CompressedFrame;
use crate::config::NetworkConfig;
use crate::constants::MAX_PACKET_SIZE;
use crate::error::NetworkError;

pub const HEADER_SIZE: usize = 6;

const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// One Opus frame on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPacket {
    pub sequence: u32,
    pub sample_count: u16,
    pub payload: Bytes,
}

impl AudioPacket {
    pub fn encode(&self) -> Result<Bytes, NetworkError> {
        let len = HEADER_SIZE + self.payload.len();
        if len > MAX_PACKET_SIZE {
            return Err(NetworkError::PacketTooLarge(len));
        }
        let mut buf = BytesMut::with_capacity(len);
        buf.put_u32(self.sequence);
        buf.put_u16(self.sample_count);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self, NetworkError> {
        if data.len() > MAX_PACKET_SIZE {
            return Err(NetworkError::PacketTooLarge(data.len()));
        }
        if data.len() < HEADER_SIZE {
            return Err(NetworkError::InvalidPacket);
        }
        let mut buf = data;
        let sequence = buf.get_u32();
        let sample_count = buf.get_u16();
        Ok(Self {
            sequence,
            sample_count,
            payload: Bytes::copy_from_slice(buf),
        })
    }

    pub fn frame(&self) -> CompressedFrame<'_> {
        CompressedFrame::from_wire(&self.payload, self.sample_count as usize)
    }
}

/// Create a UDP socket bound to `addr` with the given kernel buffer sizes
pub fn create_socket(addr: SocketAddr, buffer_size: usize) -> Result<UdpSocket, NetworkError> {
    let bind_err = |e: std::io::Error| NetworkError::BindFailed(format!("{}: {}", addr, e));

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP)).map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    if buffer_size > 0 {
        // Kernels may clamp these; not fatal
        if let Err(e) = socket.set_recv_buffer_size(buffer_size) {
            tracing::debug!("Could not set receive buffer size: {}", e);
        }
        if let Err(e) = socket.set_send_buffer_size(buffer_size) {
            tracing::debug!("Could not set send buffer size: {}", e);
        }
    }
    socket.bind(&addr.into()).map_err(bind_err)?;
    Ok(socket.into())
}

/// Sends encoded frames to a fixed peer
pub struct UdpAudioSink {
    socket: UdpSocket,
    peer: SocketAddr,
    sequence: AtomicU32,
    packets_sent: AtomicU64,
    send_errors: AtomicU64,
}

impl UdpAudioSink {
    /// Bind an ephemeral local port and send to `config.peer_address`
    pub fn connect(config: &NetworkConfig) -> Result<Self, NetworkError> {
        let peer = config.peer_address;
        let unspecified = match peer.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let socket = create_socket(SocketAddr::new(unspecified, 0), config.socket_buffer_size)?;
        tracing::info!("Sending audio to {}", peer);
        Ok(Self {
            socket,
            peer,
            sequence: AtomicU32::new(0),
            packets_sent: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    pub fn send_errors(&self) -> u64 {
        self.send_errors.load(Ordering::Relaxed)
    }
}

impl EncodedAudioSink for UdpAudioSink {
    fn send_encoded_audio(&self, payload: &[u8], samples: usize) {
        let packet = AudioPacket {
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            sample_count: samples.min(u16::MAX as usize) as u16,
            payload: Bytes::copy_from_slice(payload),
        };
        let result = packet
            .encode()
            .and_then(|data| {
                self.socket
                    .send_to(&data, self.peer)
                    .map_err(|e| NetworkError::SendFailed(e.to_string()))
            });
        match result {
            Ok(_) => {
                self.packets_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.send_errors.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(sequence = packet.sequence, "Dropped outgoing frame: {}", e);
            }
        }
    }
}

/// What to do with an arriving sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Deliver after `lost` concealment markers
    Deliver { lost: u32 },
    /// Older than what was already delivered
    Late,
}

/// Orders an incoming packet stream by sequence number
#[derive(Debug, Clone)]
pub struct SequenceTracker {
    expected: Option<u32>,
    max_concealed_gap: u32,
}

impl SequenceTracker {
    pub fn new(max_concealed_gap: u32) -> Self {
        Self {
            expected: None,
            max_concealed_gap,
        }
    }

    pub fn admit(&mut self, sequence: u32) -> Admission {
        let Some(expected) = self.expected else {
            self.expected = Some(sequence.wrapping_add(1));
            return Admission::Deliver { lost: 0 };
        };

        let ahead = sequence.wrapping_sub(expected);
        if ahead > u32::MAX / 2 {
            return Admission::Late;
        }

        self.expected = Some(sequence.wrapping_add(1));
        if ahead > self.max_concealed_gap {
            // Too long to conceal; treat as a fresh stream
            tracing::debug!(gap = ahead, "Sequence jump, resynchronising");
            Admission::Deliver { lost: 0 }
        } else {
            Admission::Deliver { lost: ahead }
        }
    }
}

#[derive(Default)]
struct ReceiverCounters {
    packets: AtomicU64,
    concealed: AtomicU64,
    late: AtomicU64,
    invalid: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct ReceiverStats {
    pub packets: u64,
    pub concealed: u64,
    pub late: u64,
    pub invalid: u64,
}

/// Receives packets and pushes them into a [`CompressedFrameHandler`]
pub struct UdpAudioReceiver {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    counters: Arc<ReceiverCounters>,
    handle: Option<JoinHandle<()>>,
}

impl UdpAudioReceiver {
    /// Bind `config.bind_address` and start the receive thread
    pub fn spawn(config: &NetworkConfig, handler: Arc<dyn CompressedFrameHandler>) -> Result<Self, NetworkError> {
        let socket = create_socket(config.bind_address, config.socket_buffer_size)?;
        socket
            .set_read_timeout(Some(READ_TIMEOUT))
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(ReceiverCounters::default());
        let tracker = SequenceTracker::new(config.max_concealed_gap);

        let handle = {
            let running = running.clone();
            let counters = counters.clone();
            thread::Builder::new()
                .name("udp-receive".into())
                .spawn(move || receive_loop(socket, handler, tracker, running, counters))
                .map_err(|e| NetworkError::BindFailed(e.to_string()))?
        };

        tracing::info!("Receiving audio on {}", local_addr);
        Ok(Self {
            local_addr,
            running,
            counters,
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    pub fn stats(&self) -> ReceiverStats {
        ReceiverStats {
            packets: self.counters.packets.load(Ordering::Relaxed),
            concealed: self.counters.concealed.load(Ordering::Relaxed),
            late: self.counters.late.load(Ordering::Relaxed),
            invalid: self.counters.invalid.load(Ordering::Relaxed),
        }
    }
}

impl Drop for UdpAudioReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop(
    socket: UdpSocket,
    handler: Arc<dyn CompressedFrameHandler>,
    mut tracker: SequenceTracker,
    running: Arc<AtomicBool>,
    counters: Arc<ReceiverCounters>,
) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE + 1];

    while running.load(Ordering::Relaxed) {
        let len = match socket.recv_from(&mut buf) {
            Ok((len, _)) => len,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(e) => {
                tracing::warn!("{}", NetworkError::ReceiveFailed(e.to_string()));
                thread::sleep(READ_TIMEOUT);
                continue;
            }
        };

        let packet = match AudioPacket::decode(&buf[..len]) {
            Ok(packet) => packet,
            Err(e) => {
                counters.invalid.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Ignoring datagram: {}", e);
                continue;
            }
        };
        counters.packets.fetch_add(1, Ordering::Relaxed);

        match tracker.admit(packet.sequence) {
            Admission::Late => {
                counters.late.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(sequence = packet.sequence, "Dropping late packet");
            }
            Admission::Deliver { lost } => {
                for _ in 0..lost {
                    handler.on_compressed_frame(CompressedFrame::Lost);
                }
                counters.concealed.fetch_add(lost as u64, Ordering::Relaxed);
                handler.on_compressed_frame(packet.frame());
            }
        }
    }
    tracing::debug!("UDP receive loop exiting");
}
