//! Real-time MIDI ring buffer.
//!
//! The control thread writes 3-integer event records, the render thread
//! drains them. The ring itself holds only the payload; its cursor lives in
//! the shared state region as `AVAIL_RTMIDI_EVENTS` (unread count) and
//! `RTMIDI_INDEX` (slot offset of the oldest unread event). The next write
//! slot is `(count * 3 + index) mod slots`.
//!
//! Overflow policy is drop-newest: once `capacity` events are unread,
//! further events are rejected and counted instead of wrapping over
//! unread slots.

use crate::shared_state::{SharedStateRegion, StateField};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

/// Integers per MIDI event record.
pub const MIDI_PAYLOAD_SIZE: usize = 3;

/// A raw MIDI event as written by the control thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiEvent {
    pub status: i32,
    pub data1: i32,
    pub data2: i32,
}

impl MidiEvent {
    pub fn new(status: i32, data1: i32, data2: i32) -> Self {
        Self {
            status,
            data1,
            data2,
        }
    }

    /// Note-on on a 0-based channel.
    pub fn note_on(channel: u8, note: u8, velocity: u8) -> Self {
        Self::new(
            0x90 | (channel & 0x0F) as i32,
            (note & 0x7F) as i32,
            (velocity & 0x7F) as i32,
        )
    }

    /// Note-off on a 0-based channel.
    pub fn note_off(channel: u8, note: u8) -> Self {
        Self::new(0x80 | (channel & 0x0F) as i32, (note & 0x7F) as i32, 0)
    }

    /// Control change on a 0-based channel.
    pub fn control_change(channel: u8, controller: u8, value: u8) -> Self {
        Self::new(
            0xB0 | (channel & 0x0F) as i32,
            (controller & 0x7F) as i32,
            (value & 0x7F) as i32,
        )
    }
}

/// Fixed-capacity circular buffer of MIDI event records.
pub struct MidiRingBuffer {
    slots: Box<[AtomicI32]>,
    capacity: usize,
    dropped: AtomicU64,
}

impl MidiRingBuffer {
    /// Create a ring holding up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let slots = (0..capacity * MIDI_PAYLOAD_SIZE)
            .map(|_| AtomicI32::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Capacity in events.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events rejected because the ring was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Unread events according to `state`.
    pub fn pending(&self, state: &SharedStateRegion) -> usize {
        state.get(StateField::AvailRtmidiEvents).max(0) as usize
    }

    /// Append an event (control thread).
    ///
    /// Returns `false` and drops the event when `capacity` events are
    /// already unread.
    pub fn enqueue(&self, state: &SharedStateRegion, event: MidiEvent) -> bool {
        let queued = self.pending(state);
        if queued >= self.capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let index = state.get(StateField::RtmidiIndex).max(0) as usize;
        let next = (queued * MIDI_PAYLOAD_SIZE + index) % self.slots.len();

        self.slots[next].store(event.status, Ordering::SeqCst);
        self.slots[next + 1].store(event.data1, Ordering::SeqCst);
        self.slots[next + 2].store(event.data2, Ordering::SeqCst);
        state.add(StateField::AvailRtmidiEvents, 1);
        true
    }

    /// Deliver every unread event to `f` in FIFO order (render thread).
    ///
    /// Advances `RTMIDI_INDEX` past the drained records, then lowers the
    /// unread count by the number delivered. Does not allocate.
    pub fn drain<F>(&self, state: &SharedStateRegion, mut f: F) -> usize
    where
        F: FnMut(MidiEvent),
    {
        let available = self.pending(state).min(self.capacity);
        if available == 0 {
            return 0;
        }
        let mut index = state.get(StateField::RtmidiIndex).max(0) as usize % self.slots.len();
        for _ in 0..available {
            f(MidiEvent {
                status: self.slots[index].load(Ordering::SeqCst),
                data1: self.slots[index + 1].load(Ordering::SeqCst),
                data2: self.slots[index + 2].load(Ordering::SeqCst),
            });
            index = (index + MIDI_PAYLOAD_SIZE) % self.slots.len();
        }
        state.set(StateField::RtmidiIndex, index as i32);
        state.add(StateField::AvailRtmidiEvents, -(available as i32));
        available
    }
}

impl std::fmt::Debug for MidiRingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MidiRingBuffer")
            .field("capacity", &self.capacity)
            .field("dropped", &self.dropped_events())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_all(ring: &MidiRingBuffer, state: &SharedStateRegion) -> Vec<MidiEvent> {
        let mut out = Vec::new();
        ring.drain(state, |e| out.push(e));
        out
    }

    #[test]
    fn test_fifo_order() {
        let state = SharedStateRegion::new();
        let ring = MidiRingBuffer::new(8);
        let events = [
            MidiEvent::note_on(0, 60, 100),
            MidiEvent::control_change(1, 7, 64),
            MidiEvent::note_off(0, 60),
        ];
        for e in events {
            assert!(ring.enqueue(&state, e));
        }
        assert_eq!(ring.pending(&state), 3);
        assert_eq!(drain_all(&ring, &state), events.to_vec());
        assert_eq!(ring.pending(&state), 0);
        assert_eq!(state.get(StateField::RtmidiIndex), 9);
    }

    #[test]
    fn test_wraps_after_drain() {
        let state = SharedStateRegion::new();
        let ring = MidiRingBuffer::new(4);
        let expected: Vec<_> = (0..15).map(|i| MidiEvent::new(0x90, i, 1)).collect();

        // Batches of 3 against a ring of 4 wrap the cursor several times
        let mut got = Vec::new();
        for chunk in expected.chunks(3) {
            for e in chunk {
                assert!(ring.enqueue(&state, *e));
            }
            got.extend(drain_all(&ring, &state));
        }
        assert_eq!(got, expected);
        assert_eq!(ring.dropped_events(), 0);
    }

    #[test]
    fn test_full_ring_drops_newest() {
        let state = SharedStateRegion::new();
        let ring = MidiRingBuffer::new(2);
        assert!(ring.enqueue(&state, MidiEvent::new(1, 1, 1)));
        assert!(ring.enqueue(&state, MidiEvent::new(2, 2, 2)));
        assert!(!ring.enqueue(&state, MidiEvent::new(3, 3, 3)));
        assert_eq!(ring.dropped_events(), 1);

        let got = drain_all(&ring, &state);
        assert_eq!(got, vec![MidiEvent::new(1, 1, 1), MidiEvent::new(2, 2, 2)]);

        // Space frees up after the drain
        assert!(ring.enqueue(&state, MidiEvent::new(4, 4, 4)));
        assert_eq!(drain_all(&ring, &state), vec![MidiEvent::new(4, 4, 4)]);
    }

    #[test]
    fn test_drain_empty() {
        let state = SharedStateRegion::new();
        let ring = MidiRingBuffer::new(4);
        assert_eq!(ring.drain(&state, |_| panic!("no events expected")), 0);
    }

    #[test]
    fn test_fresh_region_resets_cursor() {
        let ring = MidiRingBuffer::new(4);
        let old = SharedStateRegion::new();
        ring.enqueue(&old, MidiEvent::new(1, 2, 3));

        let fresh = SharedStateRegion::new();
        assert_eq!(ring.pending(&fresh), 0);
        assert!(ring.enqueue(&fresh, MidiEvent::new(4, 5, 6)));
        assert_eq!(drain_all(&ring, &fresh), vec![MidiEvent::new(4, 5, 6)]);
    }
}
