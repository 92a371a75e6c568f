//! Audio sample rings shared between the engine and the render thread.
//!
//! Each ring is a flat run of `f64` samples stored as atomic bit patterns.
//! Frame layout (interleaved, `nchnls` wide) is agreed out of band through
//! the shared state region. There is no backpressure: a writer that gets
//! ahead of its reader overwrites the oldest unread samples, and the reader
//! skips past whatever was overwritten.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Single-producer, single-consumer sample ring.
pub struct AudioRingBuffer {
    samples: Box<[AtomicU64]>,
    /// Total samples ever written.
    write_pos: AtomicUsize,
    /// Total samples ever consumed.
    read_pos: AtomicUsize,
}

impl AudioRingBuffer {
    /// Allocate a ring of `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        let samples = (0..capacity.max(1))
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            samples,
            write_pos: AtomicUsize::new(0),
            read_pos: AtomicUsize::new(0),
        }
    }

    /// Capacity in samples.
    pub fn capacity(&self) -> usize {
        self.samples.len()
    }

    /// Unread samples, clamped to capacity.
    pub fn available(&self) -> usize {
        let written = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        written.saturating_sub(read).min(self.capacity())
    }

    /// Append samples, overwriting the oldest unread ones when full.
    pub fn write(&self, data: &[f64]) {
        let cap = self.capacity();
        let start = self.write_pos.load(Ordering::Relaxed);
        for (i, sample) in data.iter().enumerate() {
            self.samples[(start + i) % cap].store(sample.to_bits(), Ordering::Relaxed);
        }
        self.write_pos.store(start + data.len(), Ordering::Release);
    }

    /// Consume up to `out.len()` samples, returning how many were copied.
    pub fn read(&self, out: &mut [f64]) -> usize {
        let cap = self.capacity();
        let written = self.write_pos.load(Ordering::Acquire);
        let mut read = self.read_pos.load(Ordering::Relaxed);
        if written.saturating_sub(read) > cap {
            // Overwritten while unread
            read = written - cap;
        }
        let count = written.saturating_sub(read).min(out.len());
        for (i, slot) in out.iter_mut().take(count).enumerate() {
            *slot = f64::from_bits(self.samples[(read + i) % cap].load(Ordering::Relaxed));
        }
        self.read_pos.store(read + count, Ordering::Release);
        count
    }

    /// Discard everything unread.
    pub fn clear(&self) {
        let written = self.write_pos.load(Ordering::Acquire);
        self.read_pos.store(written, Ordering::Release);
    }
}

impl std::fmt::Debug for AudioRingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioRingBuffer")
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .finish()
    }
}

/// The pair of audio rings: render writes `input`, engine writes `output`.
#[derive(Debug, Clone)]
pub struct AudioRingBuffers {
    pub input: Arc<AudioRingBuffer>,
    pub output: Arc<AudioRingBuffer>,
}

impl AudioRingBuffers {
    /// Allocate both rings with `capacity` samples each.
    pub fn new(capacity: usize) -> Self {
        Self {
            input: Arc::new(AudioRingBuffer::new(capacity)),
            output: Arc::new(AudioRingBuffer::new(capacity)),
        }
    }

    /// Discard unread samples in both directions.
    pub fn clear(&self) {
        self.input.clear();
        self.output.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read() {
        let ring = AudioRingBuffer::new(8);
        ring.write(&[0.1, 0.2, 0.3]);
        assert_eq!(ring.available(), 3);

        let mut out = [0.0; 4];
        assert_eq!(ring.read(&mut out), 3);
        assert_eq!(&out[..3], &[0.1, 0.2, 0.3]);
        assert_eq!(ring.available(), 0);
    }

    #[test]
    fn test_partial_reads_wrap() {
        let ring = AudioRingBuffer::new(4);
        let mut out = [0.0; 3];
        for block in 0..5 {
            let base = block as f64 * 10.0;
            ring.write(&[base, base + 1.0, base + 2.0]);
            assert_eq!(ring.read(&mut out), 3);
            assert_eq!(out, [base, base + 1.0, base + 2.0]);
        }
    }

    #[test]
    fn test_overrun_skips_overwritten_samples() {
        let ring = AudioRingBuffer::new(4);
        ring.write(&[1.0, 2.0, 3.0]);
        ring.write(&[4.0, 5.0, 6.0]);
        assert_eq!(ring.available(), 4);

        let mut out = [0.0; 8];
        assert_eq!(ring.read(&mut out), 4);
        assert_eq!(&out[..4], &[3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_clear() {
        let rings = AudioRingBuffers::new(16);
        rings.output.write(&[1.0; 5]);
        rings.input.write(&[1.0; 2]);
        rings.clear();
        assert_eq!(rings.output.available(), 0);
        assert_eq!(rings.input.available(), 0);
    }
}
