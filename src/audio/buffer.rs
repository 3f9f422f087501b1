//! Frame-addressed ring buffer for audio samples
//!
//! Single producer, single consumer. Both sides address audio by logical
//! frame number in an endless stream; the number is mapped onto storage
//! modulo the capacity. The producer owns `head`, the consumer owns `read`,
//! and `tail` marks the oldest frame still held in storage.
//!
//! Samples live in atomic cells, so a producer that laps a slow consumer
//! can tear a frame but never cause a data race. `fetch` re-checks `tail`
//! after copying and silences anything overwritten mid-copy.

use crossbeam::utils::CachePadded;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{AudioError, RingBufferError};

/// Ring buffer of interleaved `f32` audio frames
#[derive(Debug, Default)]
pub struct RingBuffer {
    samples: Box<[AtomicU32]>,
    channels: usize,
    capacity: u64,
    /// One past the newest stored frame
    head: CachePadded<AtomicU64>,
    /// Oldest frame still in storage
    tail: CachePadded<AtomicU64>,
    /// One past the newest frame handed to the consumer
    read: CachePadded<AtomicU64>,
    overrun_count: AtomicUsize,
    underrun_count: AtomicUsize,
}

impl RingBuffer {
    /// An unallocated buffer; `store` and `fetch` fail until `allocate`
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a ring holding `capacity_frames` frames of `channels` samples
    pub fn with_capacity(channels: usize, capacity_frames: usize) -> Result<Self, AudioError> {
        let mut ring = Self::new();
        ring.allocate(channels, capacity_frames)?;
        Ok(ring)
    }

    /// Reserve backing storage, replacing any previous allocation
    pub fn allocate(&mut self, channels: usize, capacity_frames: usize) -> Result<(), AudioError> {
        if channels == 0 || capacity_frames == 0 {
            return Err(AudioError::UnsupportedFormat(format!(
                "ring of {capacity_frames} frames x {channels} channels"
            )));
        }
        let len = channels
            .checked_mul(capacity_frames)
            .ok_or(AudioError::ResourceExhausted(usize::MAX))?;

        let mut storage = Vec::new();
        storage
            .try_reserve_exact(len)
            .map_err(|_| AudioError::ResourceExhausted(len))?;
        storage.extend((0..len).map(|_| AtomicU32::new(0)));

        self.samples = storage.into_boxed_slice();
        self.channels = channels;
        self.capacity = capacity_frames as u64;
        self.reset_indices();
        Ok(())
    }

    /// Release backing storage; harmless on an unallocated buffer
    pub fn deallocate(&mut self) {
        self.samples = Box::default();
        self.channels = 0;
        self.capacity = 0;
        self.reset_indices();
    }

    pub fn is_allocated(&self) -> bool {
        self.capacity > 0
    }

    /// Forget all buffered audio and restart both indices at frame 0
    ///
    /// Only call while neither side is running.
    pub fn clear(&self) {
        for sample in self.samples.iter() {
            sample.store(0, Ordering::Relaxed);
        }
        self.reset_indices();
    }

    fn reset_indices(&self) {
        self.head.store(0, Ordering::Release);
        self.tail.store(0, Ordering::Release);
        self.read.store(0, Ordering::Release);
    }

    /// Copy `frame_count` frames from `src` into the ring starting at frame `at`
    ///
    /// Storing past the consumer by more than the capacity overwrites the
    /// oldest unread frames and reports `Overrun`; the data is still stored.
    pub fn store(&self, src: &[f32], frame_count: usize, at: u64) -> Result<(), RingBufferError> {
        if !self.is_allocated() {
            return Err(RingBufferError::NotAllocated);
        }
        let required = frame_count * self.channels;
        if src.len() < required {
            return Err(RingBufferError::LengthMismatch {
                required,
                available: src.len(),
            });
        }
        if frame_count == 0 {
            return Ok(());
        }
        if frame_count as u64 > self.capacity {
            return Err(RingBufferError::TooMuch {
                requested: frame_count,
                capacity: self.capacity as usize,
            });
        }

        let head = self.head.load(Ordering::Acquire);
        if at < head {
            return Err(RingBufferError::Behind { at, head });
        }
        let end = at + frame_count as u64;
        let read = self.read.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);

        // Invalidate whatever is about to be overwritten before touching it
        let oldest_kept = end.saturating_sub(self.capacity);
        let mut result = Ok(());
        if oldest_kept > tail {
            self.tail.store(oldest_kept, Ordering::Release);
        }
        if oldest_kept > read {
            let dropped = oldest_kept - read.max(tail);
            self.overrun_count.fetch_add(1, Ordering::Relaxed);
            result = Err(RingBufferError::Overrun { dropped });
        }
        // Keeps the cell writes below from becoming visible before `tail`
        fence(Ordering::Release);

        // A gap between head and `at` becomes silence
        let gap_start = head.max(oldest_kept);
        if at > gap_start {
            self.fill_silence(gap_start, at);
        }
        self.write_frames(&src[..required], at);
        self.head.store(end, Ordering::Release);
        result
    }

    /// Copy `frame_count` frames starting at frame `at` into `dst`
    ///
    /// Frames the producer has not written yet, or has already overwritten,
    /// come back as silence and the call reports `Underrun`.
    pub fn fetch(&self, dst: &mut [f32], frame_count: usize, at: u64) -> Result<(), RingBufferError> {
        if !self.is_allocated() {
            return Err(RingBufferError::NotAllocated);
        }
        let required = frame_count * self.channels;
        if dst.len() < required {
            return Err(RingBufferError::LengthMismatch {
                required,
                available: dst.len(),
            });
        }
        let dst = &mut dst[..required];
        if frame_count == 0 {
            return Ok(());
        }

        let end = at + frame_count as u64;
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        let valid_start = at.max(tail).min(end);
        let valid_end = end.min(head).max(valid_start);

        self.zero_span(dst, at, at, valid_start);
        self.read_frames(dst, at, valid_start, valid_end);
        self.zero_span(dst, at, valid_end, end);

        // The producer may have lapped us while copying; the fence keeps the
        // cell reads above from sinking below this load
        fence(Ordering::Acquire);
        let tail_after = self.tail.load(Ordering::Acquire);
        let torn_end = tail_after.min(valid_end);
        let torn = torn_end.saturating_sub(valid_start);
        if torn > 0 {
            self.zero_span(dst, at, valid_start, torn_end);
        }

        let consumed = end.min(head);
        if consumed > self.read.load(Ordering::Relaxed) {
            self.read.store(consumed, Ordering::Release);
        }

        let missing = frame_count as u64 - (valid_end - valid_start);
        if missing > 0 {
            self.underrun_count.fetch_add(1, Ordering::Relaxed);
            return Err(RingBufferError::Underrun { missing: missing + torn });
        }
        if torn > 0 {
            self.overrun_count.fetch_add(1, Ordering::Relaxed);
            return Err(RingBufferError::Overrun { dropped: torn });
        }
        Ok(())
    }

    /// Frames stored at or after `index` that are still in storage
    pub fn available_from(&self, index: u64) -> u64 {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.saturating_sub(index.max(tail))
    }

    pub fn head(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    pub fn tail(&self) -> u64 {
        self.tail.load(Ordering::Acquire)
    }

    pub fn read_position(&self) -> u64 {
        self.read.load(Ordering::Acquire)
    }

    pub fn capacity_frames(&self) -> usize {
        self.capacity as usize
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.channels * std::mem::size_of::<f32>()
    }

    /// Unread frames as a fraction of capacity
    pub fn fill_level(&self) -> f32 {
        if !self.is_allocated() {
            return 0.0;
        }
        let unread = self.available_from(self.read_position());
        unread as f32 / self.capacity as f32
    }

    pub fn overrun_count(&self) -> usize {
        self.overrun_count.load(Ordering::Relaxed)
    }

    pub fn underrun_count(&self) -> usize {
        self.underrun_count.load(Ordering::Relaxed)
    }

    pub fn reset_stats(&self) {
        self.overrun_count.store(0, Ordering::Relaxed);
        self.underrun_count.store(0, Ordering::Relaxed);
    }

    /// Storage sample offset of a logical frame
    #[inline]
    fn offset(&self, frame: u64) -> usize {
        (frame % self.capacity) as usize * self.channels
    }

    fn write_frames(&self, src: &[f32], at: u64) {
        let mut frame = at;
        for chunk in src.chunks_exact(self.channels) {
            let base = self.offset(frame);
            for (cell, value) in self.samples[base..base + self.channels].iter().zip(chunk) {
                cell.store(value.to_bits(), Ordering::Relaxed);
            }
            frame += 1;
        }
    }

    fn fill_silence(&self, from: u64, to: u64) {
        for frame in from..to {
            let base = self.offset(frame);
            for cell in &self.samples[base..base + self.channels] {
                cell.store(0, Ordering::Relaxed);
            }
        }
    }

    /// Copy frames `[from, to)` into `dst`, whose first frame is `origin`
    fn read_frames(&self, dst: &mut [f32], origin: u64, from: u64, to: u64) {
        for frame in from..to {
            let base = self.offset(frame);
            let out = (frame - origin) as usize * self.channels;
            for (value, cell) in dst[out..out + self.channels]
                .iter_mut()
                .zip(&self.samples[base..base + self.channels])
            {
                *value = f32::from_bits(cell.load(Ordering::Relaxed));
            }
        }
    }

    /// Zero frames `[from, to)` of `dst`, whose first frame is `origin`
    fn zero_span(&self, dst: &mut [f32], origin: u64, from: u64, to: u64) {
        if to > from {
            let start = (from - origin) as usize * self.channels;
            let stop = (to - origin) as usize * self.channels;
            dst[start..stop].fill(0.0);
        }
    }
}

/// Thread-safe handle to a ring buffer
pub type SharedRingBuffer = Arc<RingBuffer>;

/// Allocate a shared ring buffer
pub fn create_shared_buffer(
    channels: usize,
    capacity_frames: usize,
) -> Result<SharedRingBuffer, AudioError> {
    RingBuffer::with_capacity(channels, capacity_frames).map(Arc::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ramp(start: f32, frames: usize, channels: usize) -> Vec<f32> {
        (0..frames * channels).map(|i| start + i as f32).collect()
    }

    #[test]
    fn test_store_then_fetch() {
        let ring = RingBuffer::with_capacity(2, 16).unwrap();
        let data = ramp(1.0, 8, 2);

        ring.store(&data, 8, 0).unwrap();
        assert_eq!(ring.head(), 8);

        let mut out = vec![0.0; 16];
        ring.fetch(&mut out, 8, 0).unwrap();
        assert_eq!(out, data);
        assert_eq!(ring.read_position(), 8);
    }

    #[test]
    fn test_wraps_around_storage() {
        let ring = RingBuffer::with_capacity(1, 4).unwrap();
        let mut out = vec![0.0; 3];
        for block in 0..5u64 {
            let data = ramp(block as f32 * 10.0, 3, 1);
            ring.store(&data, 3, block * 3).unwrap();
            ring.fetch(&mut out, 3, block * 3).unwrap();
            assert_eq!(out, data);
        }
    }

    #[test]
    fn test_underrun_yields_silence() {
        let ring = RingBuffer::with_capacity(2, 8).unwrap();
        ring.store(&ramp(1.0, 2, 2), 2, 0).unwrap();

        let mut out = vec![7.0; 8];
        let err = ring.fetch(&mut out, 4, 0).unwrap_err();
        assert_eq!(err, RingBufferError::Underrun { missing: 2 });
        assert_eq!(&out[..4], &[1.0, 2.0, 3.0, 4.0]);
        assert!(out[4..].iter().all(|&s| s == 0.0));
        assert_eq!(ring.underrun_count(), 1);

        // Never written at all
        let mut out = vec![7.0; 8];
        assert!(ring.fetch(&mut out, 4, 100).is_err());
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(ring.read_position(), 2);
    }

    #[test]
    fn test_overrun_is_reported_and_bounded() {
        let ring = RingBuffer::with_capacity(1, 4).unwrap();
        ring.store(&[1.0, 2.0, 3.0], 3, 0).unwrap();

        // Consumer has read nothing; two unread frames get overwritten
        let err = ring.store(&[4.0, 5.0, 6.0], 3, 3).unwrap_err();
        assert_eq!(err, RingBufferError::Overrun { dropped: 2 });
        assert_eq!(ring.tail(), 2);
        assert_eq!(ring.overrun_count(), 1);

        // The newest `capacity` frames survive intact
        let mut out = vec![0.0; 4];
        ring.fetch(&mut out, 4, 2).unwrap();
        assert_eq!(out, vec![3.0, 4.0, 5.0, 6.0]);

        // Overwritten frames read back as silence
        let mut out = vec![9.0; 2];
        assert!(ring.fetch(&mut out, 2, 0).is_err());
        assert_eq!(out, vec![0.0, 0.0]);
    }

    #[test]
    fn test_no_overrun_when_consumer_keeps_up() {
        let ring = RingBuffer::with_capacity(1, 4).unwrap();
        let mut out = vec![0.0; 4];
        ring.store(&[1.0; 4], 4, 0).unwrap();
        ring.fetch(&mut out, 4, 0).unwrap();
        assert!(ring.store(&[2.0; 4], 4, 4).is_ok());
        assert_eq!(ring.overrun_count(), 0);
    }

    #[test]
    fn test_rejects_stale_and_oversized_stores() {
        let ring = RingBuffer::with_capacity(1, 4).unwrap();
        ring.store(&[1.0, 2.0], 2, 0).unwrap();

        assert_eq!(
            ring.store(&[3.0], 1, 1),
            Err(RingBufferError::Behind { at: 1, head: 2 })
        );
        assert_eq!(
            ring.store(&[0.0; 5], 5, 2),
            Err(RingBufferError::TooMuch { requested: 5, capacity: 4 })
        );
        assert!(matches!(
            ring.store(&[0.0; 1], 2, 2),
            Err(RingBufferError::LengthMismatch { .. })
        ));
        assert_eq!(ring.head(), 2);
    }

    #[test]
    fn test_gap_is_silence() {
        let ring = RingBuffer::with_capacity(1, 8).unwrap();
        ring.store(&[1.0; 2], 2, 0).unwrap();
        ring.store(&[2.0; 2], 2, 4).unwrap();

        let mut out = vec![9.0; 6];
        ring.fetch(&mut out, 6, 0).unwrap();
        assert_eq!(out, vec![1.0, 1.0, 0.0, 0.0, 2.0, 2.0]);
    }

    #[test]
    fn test_unallocated_and_deallocate() {
        let mut ring = RingBuffer::new();
        ring.deallocate();
        assert_eq!(ring.store(&[0.0], 1, 0), Err(RingBufferError::NotAllocated));
        assert_eq!(ring.fetch(&mut [0.0], 1, 0), Err(RingBufferError::NotAllocated));

        ring.allocate(2, 4).unwrap();
        assert_eq!(ring.bytes_per_frame(), 8);
        ring.store(&[1.0; 8], 4, 0).unwrap();
        ring.deallocate();
        assert!(!ring.is_allocated());
        ring.deallocate();
    }

    #[test]
    fn test_allocation_failure_is_an_error() {
        let err = RingBuffer::with_capacity(usize::MAX / 2, 4).unwrap_err();
        assert!(matches!(err, AudioError::ResourceExhausted(_)));
        assert!(RingBuffer::with_capacity(0, 4).is_err());
    }

    #[test]
    fn test_clear_restarts_at_zero() {
        let ring = RingBuffer::with_capacity(1, 4).unwrap();
        ring.store(&[1.0; 3], 3, 0).unwrap();
        ring.clear();
        assert_eq!(ring.head(), 0);
        assert_eq!(ring.available_from(0), 0);
        ring.store(&[2.0; 3], 3, 0).unwrap();
        assert!((ring.fill_level() - 0.75).abs() < f32::EPSILON);
    }

    #[test]
    fn test_concurrent_producer_consumer() {
        const FRAMES: u64 = 20_000;
        let ring = create_shared_buffer(2, 256).unwrap();

        let producer = {
            let ring = ring.clone();
            std::thread::spawn(move || {
                let mut at = 0u64;
                while at < FRAMES {
                    // Stay within capacity of the consumer
                    if at + 16 > ring.read_position() + 256 {
                        std::thread::yield_now();
                        continue;
                    }
                    let block: Vec<f32> = (at..at + 16).flat_map(|f| [f as f32, -(f as f32)]).collect();
                    ring.store(&block, 16, at).unwrap();
                    at += 16;
                }
            })
        };

        let mut at = 0u64;
        let mut out = vec![0.0; 32];
        while at < FRAMES {
            if ring.available_from(at) < 16 {
                std::thread::yield_now();
                continue;
            }
            ring.fetch(&mut out, 16, at).unwrap();
            for (i, pair) in out.chunks_exact(2).enumerate() {
                let expected = (at + i as u64) as f32;
                assert_eq!(pair, &[expected, -expected]);
            }
            at += 16;
        }
        producer.join().unwrap();
        assert_eq!(ring.overrun_count(), 0);
    }

    #[test]
    fn test_lapping_producer_never_yields_mixed_frames() {
        const CHANNELS: usize = 2;
        const CHUNK: usize = 64;
        const END: u64 = 1 << 20;
        let ring = create_shared_buffer(CHANNELS, 256).unwrap();

        // Every sample of frame n holds n, so a frame from another lap shows up
        let producer = {
            let ring = ring.clone();
            std::thread::spawn(move || {
                let mut at = 0u64;
                let mut chunk = vec![0.0f32; CHUNK * CHANNELS];
                while at < END {
                    for (i, frame) in chunk.chunks_exact_mut(CHANNELS).enumerate() {
                        frame.fill((at + i as u64) as f32);
                    }
                    let _ = ring.store(&chunk, CHUNK, at);
                    at += CHUNK as u64;
                }
            })
        };

        let mut dst = vec![0.0f32; 128 * CHANNELS];
        while ring.head() < END {
            let at = ring.head().saturating_sub(250);
            if ring.fetch(&mut dst, 128, at).is_ok() {
                for (i, frame) in dst.chunks_exact(CHANNELS).enumerate() {
                    let expected = (at + i as u64) as f32;
                    assert!(frame.iter().all(|&s| s == expected), "frame {} came back torn", at + i as u64);
                }
            }
        }
        producer.join().unwrap();
        // Once the producer is done the ring must read back cleanly
        let at = ring.head() - 128;
        ring.fetch(&mut dst, 128, at).unwrap();
        assert_eq!(dst[0], at as f32);
    }

    proptest! {
        #[test]
        fn fifo_when_consumer_within_capacity(
            blocks in proptest::collection::vec(1usize..24, 1..40),
            capacity in 24usize..96,
        ) {
            let ring = RingBuffer::with_capacity(2, capacity).unwrap();
            let mut at = 0u64;
            let mut value = 0.0f32;
            for frames in blocks {
                let data: Vec<f32> = (0..frames * 2).map(|_| { value += 1.0; value }).collect();
                prop_assert!(ring.store(&data, frames, at).is_ok());
                let mut out = vec![0.0; frames * 2];
                prop_assert!(ring.fetch(&mut out, frames, at).is_ok());
                prop_assert_eq!(out, data);
                at += frames as u64;
            }
        }
    }
}
