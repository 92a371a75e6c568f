//! Shared state region between the control, engine and render threads.
//!
//! The region is a fixed block of atomic `i32` slots. It is the only
//! control-plane channel between threads: no field is ever protected by a
//! lock, every read and write is a single atomic operation on one slot.
//! Invariants that span several fields are kept by write ordering (for
//! example, a stop request clears the pause flag before raising `Stop`).
//!
//! The slot layout is a binary protocol shared by everyone holding the
//! region. [`LAYOUT_VERSION`] must change whenever [`StateField`] changes.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Version of the slot layout described by [`StateField`].
pub const LAYOUT_VERSION: i32 = 1;

/// Which side of the protocol owns writes to a field.
///
/// Every side may read every field. Two concurrent writers on the same
/// field are not a supported configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Writer {
    /// The engine worker thread.
    Engine,
    /// The control thread.
    Control,
    /// The real-time render thread.
    Render,
    /// A notification line: raised by one side, lowered by another.
    Shared,
}

/// Named slots of the shared state region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum StateField {
    IsPerforming = 0,
    IsRendering,
    IsPaused,
    Stop,
    SampleRate,
    Ksmps,
    /// Output channel count.
    Nchnls,
    /// Input channel count.
    NchnlsI,
    IsRequestingMic,
    IsRequestingRtmidi,
    /// Slot offset of the oldest unread MIDI event.
    RtmidiIndex,
    /// Number of unread MIDI events.
    AvailRtmidiEvents,
    HwBufferSize,
    SwBufferSize,
    /// Raised by the render thread at every cycle boundary and by stop.
    AtomicNotify,
    LayoutVersion,
}

impl StateField {
    /// Every field, in slot order.
    pub const ALL: [StateField; 16] = [
        StateField::IsPerforming,
        StateField::IsRendering,
        StateField::IsPaused,
        StateField::Stop,
        StateField::SampleRate,
        StateField::Ksmps,
        StateField::Nchnls,
        StateField::NchnlsI,
        StateField::IsRequestingMic,
        StateField::IsRequestingRtmidi,
        StateField::RtmidiIndex,
        StateField::AvailRtmidiEvents,
        StateField::HwBufferSize,
        StateField::SwBufferSize,
        StateField::AtomicNotify,
        StateField::LayoutVersion,
    ];

    /// Number of slots in the region.
    pub const COUNT: usize = Self::ALL.len();

    /// Slot index of this field.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Value stored on allocation and on every reinitialization.
    pub fn initial_value(self) -> i32 {
        match self {
            StateField::SampleRate => 44100,
            StateField::Ksmps => 32,
            StateField::Nchnls => 2,
            StateField::HwBufferSize => 4096,
            StateField::SwBufferSize => 256,
            StateField::LayoutVersion => LAYOUT_VERSION,
            _ => 0,
        }
    }

    /// The designated writer of this field.
    pub fn writer(self) -> Writer {
        match self {
            StateField::IsPaused | StateField::Stop => Writer::Control,
            StateField::AtomicNotify => Writer::Shared,
            // Control raises AVAIL_RTMIDI_EVENTS, render lowers it; both go
            // through atomic add so neither side overwrites the other.
            StateField::AvailRtmidiEvents => Writer::Shared,
            StateField::RtmidiIndex => Writer::Render,
            StateField::LayoutVersion => Writer::Control,
            // IS_PERFORMING is lowered by control on stop, raised by the engine
            _ => Writer::Engine,
        }
    }
}

/// Outcome of [`SharedStateRegion::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// Woken by a notification on the field.
    Ok,
    /// The field did not hold the expected value on entry.
    NotEqual,
    /// Nobody notified the field before the timeout.
    TimedOut,
}

/// Fixed-layout block of atomically accessed integer fields.
pub struct SharedStateRegion {
    slots: [AtomicI32; StateField::COUNT],
    /// Per-field notification counters, bumped under `lock` by `notify_all`.
    generations: [AtomicU32; StateField::COUNT],
    lock: Mutex<()>,
    wakeup: Condvar,
}

impl Default for SharedStateRegion {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedStateRegion {
    /// Allocate a region holding the initial value of every field.
    pub fn new() -> Self {
        let region = Self {
            slots: std::array::from_fn(|_| AtomicI32::new(0)),
            generations: std::array::from_fn(|_| AtomicU32::new(0)),
            lock: Mutex::new(()),
            wakeup: Condvar::new(),
        };
        region.reinitialize();
        region
    }

    /// Atomically read a field.
    pub fn get(&self, field: StateField) -> i32 {
        self.slots[field.index()].load(Ordering::SeqCst)
    }

    /// Atomically write a field.
    pub fn set(&self, field: StateField, value: i32) {
        self.slots[field.index()].store(value, Ordering::SeqCst);
    }

    /// Atomically add `delta` to a field, returning the previous value.
    pub fn add(&self, field: StateField, delta: i32) -> i32 {
        self.slots[field.index()].fetch_add(delta, Ordering::SeqCst)
    }

    /// Convenience for boolean flags stored as 0/1.
    pub fn is_set(&self, field: StateField) -> bool {
        self.get(field) == 1
    }

    /// Block until `field` is notified or `timeout` elapses.
    ///
    /// Returns [`WaitResult::NotEqual`] immediately if the field does not
    /// hold `expected` on entry. Never allocates, so it is usable from the
    /// render thread.
    pub fn wait(&self, field: StateField, expected: i32, timeout: Duration) -> WaitResult {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock();
        let generation = self.generations[field.index()].load(Ordering::SeqCst);
        if self.get(field) != expected {
            return WaitResult::NotEqual;
        }
        loop {
            let timed_out = self.wakeup.wait_until(&mut guard, deadline).timed_out();
            if self.generations[field.index()].load(Ordering::SeqCst) != generation {
                return WaitResult::Ok;
            }
            if timed_out {
                return WaitResult::TimedOut;
            }
        }
    }

    /// Wake every thread waiting on `field`.
    pub fn notify_all(&self, field: StateField) {
        let _guard = self.lock.lock();
        self.generations[field.index()].fetch_add(1, Ordering::SeqCst);
        self.wakeup.notify_all();
    }

    /// Store the initial value into every slot.
    pub fn reinitialize(&self) {
        for field in StateField::ALL {
            self.set(field, field.initial_value());
        }
    }

    /// Read every slot, in slot order.
    pub fn snapshot(&self) -> [i32; StateField::COUNT] {
        std::array::from_fn(|i| self.slots[i].load(Ordering::SeqCst))
    }

    /// True when every slot holds its initial value.
    pub fn is_pristine(&self) -> bool {
        StateField::ALL
            .iter()
            .all(|&field| self.get(field) == field.initial_value())
    }

    /// Layout version stored in the region.
    pub fn version(&self) -> i32 {
        self.get(StateField::LayoutVersion)
    }
}

impl std::fmt::Debug for SharedStateRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("SharedStateRegion");
        for field in StateField::ALL {
            s.field(&format!("{:?}", field), &self.get(field));
        }
        s.finish()
    }
}
