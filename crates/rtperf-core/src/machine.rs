//! Play-state machine.
//!
//! Owns the shared state region and ring buffers, sequences lifecycle
//! transitions and forwards each of them to the render coordinator and the
//! public event sink.
//!
//! Transitions arrive from two places: the engine worker (started, ended,
//! render started/ended) through the event dispatcher, and the control
//! thread itself (paused, resumed). The machine lives behind a mutex in
//! [`crate::Performance`]; callers never hold that lock while waiting on a
//! lifecycle completion.
//!
//! Lifecycle completions are one-shot channels carrying the play state that
//! resolved them:
//! - the start completion resolves on `realtimePerformanceStarted`, after the
//!   coordinator has been configured and told about the transition; any
//!   other transition observed while it is armed resolves it as well, so a
//!   start that never really began cannot hang its caller
//! - the stop completion resolves on `realtimePerformanceEnded` or
//!   `renderEnded`, after the region was reinitialized and the coordinator
//!   was told

use crate::audio::AudioRingBuffers;
use crate::coordinator::{RenderCoordinator, RenderParameters};
use crate::engine::PerformanceIo;
use crate::error::{Error, Result};
use crate::events::{PerformanceEvent, PublicEvents};
use crate::midi::MidiRingBuffer;
use crate::play_state::PlayState;
use crate::shared_state::{SharedStateRegion, StateField};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::Arc;

pub struct PlayStateMachine {
    current: PlayState,
    state: Arc<SharedStateRegion>,
    audio: AudioRingBuffers,
    midi: Arc<MidiRingBuffer>,
    coordinator: Box<dyn RenderCoordinator>,
    events: PublicEvents,
    start_signal: Option<Sender<PlayState>>,
    stop_signal: Option<Sender<PlayState>>,
    /// Set once the engine worker is gone; no transition can arrive after.
    disconnected: bool,
}

impl PlayStateMachine {
    /// Create a stopped machine over a freshly allocated region.
    pub fn new(
        audio: AudioRingBuffers,
        midi: Arc<MidiRingBuffer>,
        coordinator: Box<dyn RenderCoordinator>,
        events: PublicEvents,
    ) -> Self {
        Self {
            current: PlayState::Stopped,
            state: Arc::new(SharedStateRegion::new()),
            audio,
            midi,
            coordinator,
            events,
            start_signal: None,
            stop_signal: None,
            disconnected: false,
        }
    }

    pub fn current(&self) -> PlayState {
        self.current
    }

    /// Handle of the current region. Replaced on reset.
    pub fn shared_state(&self) -> Arc<SharedStateRegion> {
        self.state.clone()
    }

    /// The buffers handed to the engine on start.
    pub fn io(&self) -> PerformanceIo {
        PerformanceIo {
            state: self.state.clone(),
            audio: self.audio.clone(),
            midi: self.midi.clone(),
        }
    }

    pub fn events(&self) -> &PublicEvents {
        &self.events
    }

    /// Arm the start completion, replacing any earlier one.
    ///
    /// Fails once the worker is gone, since nothing could resolve it.
    pub fn arm_start(&mut self) -> Result<Receiver<PlayState>> {
        if self.disconnected {
            return Err(Error::Disconnected);
        }
        let (tx, rx) = bounded(1);
        self.start_signal = Some(tx);
        Ok(rx)
    }

    /// Drop an armed start completion without resolving it.
    pub fn disarm_start(&mut self) {
        self.start_signal = None;
    }

    /// Record that the engine worker is gone. Both completions are dropped
    /// unresolved, failing their waiters, and later lifecycle requests fail
    /// with [`Error::Disconnected`].
    pub fn mark_disconnected(&mut self) {
        if !self.disconnected {
            log::warn!("Engine worker gone while {}", self.current);
        }
        self.disconnected = true;
        self.start_signal = None;
        self.stop_signal = None;
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    /// Allocate a fresh region in place of the current one.
    pub fn replace_shared_state(&mut self) -> Arc<SharedStateRegion> {
        self.state = Arc::new(SharedStateRegion::new());
        self.state.clone()
    }

    /// Handle a transition.
    pub fn on_play_state_change(&mut self, new_state: PlayState) {
        log::debug!("Play state {} -> {}", self.current, new_state);
        self.current = new_state;

        match new_state {
            PlayState::RealtimePerformanceStarted => {
                self.prepare_realtime_performance();
                self.emit(new_state);
            }
            PlayState::RealtimePerformanceEnded | PlayState::RenderEnded => {
                self.state.reinitialize();
                self.emit(new_state);
            }
            PlayState::RealtimePerformancePaused
            | PlayState::RealtimePerformanceResumed
            | PlayState::RenderStarted => self.emit(new_state),
            PlayState::Stopped => {}
        }

        if let Err(e) = self.coordinator.on_play_state_change(new_state) {
            log::error!("Render coordinator failed on {}: {:#}", new_state, e);
        }

        if new_state.is_ended() {
            // The coordinator has joined its render loop; a cycle that was in
            // flight during the first reinitialize may have raised ATOMIC_NOTIFY.
            self.state.reinitialize();
            if let Some(stop) = self.stop_signal.take() {
                let _ = stop.send(new_state);
            }
        }
        if let Some(start) = self.start_signal.take() {
            if new_state != PlayState::RealtimePerformanceStarted {
                log::debug!("Start resolved by {}", new_state);
            }
            let _ = start.send(new_state);
        }
    }

    /// Read the engine's published parameters into the coordinator.
    fn prepare_realtime_performance(&mut self) {
        let state = &self.state;
        let input_count = state.get(StateField::NchnlsI);
        let params = RenderParameters {
            sample_rate: state.get(StateField::SampleRate),
            input_count,
            output_count: state.get(StateField::Nchnls),
            hw_buffer_size: state.get(StateField::HwBufferSize),
            sw_buffer_size: state.get(StateField::SwBufferSize),
            is_requesting_input: input_count > 0,
            is_requesting_midi: state.is_set(StateField::IsRequestingRtmidi),
            io: self.io(),
        };
        log::info!(
            "Preparing realtime performance: {} Hz, {} out, {} in, buffers {}/{}",
            params.sample_rate,
            params.output_count,
            params.input_count,
            params.hw_buffer_size,
            params.sw_buffer_size
        );
        if let Err(e) = self.coordinator.configure(params) {
            log::error!("Render coordinator rejected configuration: {:#}", e);
        }
    }

    fn emit(&self, state: PlayState) {
        self.events.emit(&PerformanceEvent::PlayState(state));
    }

    /// Pause a running performance. Ignored unless it is performing,
    /// not paused and not stopping.
    pub fn pause(&mut self) -> bool {
        let s = &self.state;
        if s.get(StateField::IsPaused) != 1
            && s.get(StateField::Stop) != 1
            && s.get(StateField::IsPerforming) == 1
        {
            s.set(StateField::IsPaused, 1);
            self.on_play_state_change(PlayState::RealtimePerformancePaused);
            true
        } else {
            false
        }
    }

    /// Resume a paused performance and wake the paused render loop.
    pub fn resume(&mut self) -> bool {
        let s = &self.state;
        if s.get(StateField::IsPaused) == 1
            && s.get(StateField::Stop) != 1
            && s.get(StateField::IsPerforming) == 1
        {
            s.set(StateField::IsPaused, 0);
            s.notify_all(StateField::IsPaused);
            self.on_play_state_change(PlayState::RealtimePerformanceResumed);
            true
        } else {
            false
        }
    }

    /// Signal every thread to stop and arm the stop completion.
    ///
    /// Returns `Ok(None)` without touching the region when the current state
    /// is not stoppable, and [`Error::Disconnected`] once the worker is gone.
    pub fn request_stop(&mut self) -> Result<Option<Receiver<PlayState>>> {
        if !self.current.is_stoppable() {
            return Ok(None);
        }
        if self.disconnected {
            return Err(Error::Disconnected);
        }
        let (tx, rx) = bounded(1);
        self.stop_signal = Some(tx);

        let s = &self.state;
        // Clear the pause first so a woken render loop observes STOP
        if self.current == PlayState::RealtimePerformancePaused {
            s.set(StateField::IsPaused, 0);
            s.notify_all(StateField::IsPaused);
        }
        s.set(StateField::Stop, 1);
        s.set(StateField::IsPerforming, 0);
        if self.current != PlayState::RenderStarted {
            s.set(StateField::AtomicNotify, 1);
            s.notify_all(StateField::AtomicNotify);
        }
        log::info!("Stop requested from {}", self.current);
        Ok(Some(rx))
    }
}

impl std::fmt::Debug for PlayStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayStateMachine")
            .field("current", &self.current)
            .field("start_armed", &self.start_signal.is_some())
            .field("stop_armed", &self.stop_signal.is_some())
            .field("disconnected", &self.disconnected)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::shared_state::WaitResult;
    use anyhow::anyhow;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorded {
        params: Vec<RenderParameters>,
        states: Vec<PlayState>,
    }

    struct RecordingCoordinator {
        log: Arc<Mutex<Recorded>>,
        fail: bool,
    }

    impl RenderCoordinator for RecordingCoordinator {
        fn configure(&mut self, params: RenderParameters) -> anyhow::Result<()> {
            self.log.lock().params.push(params);
            Ok(())
        }

        fn on_play_state_change(&mut self, state: PlayState) -> anyhow::Result<()> {
            self.log.lock().states.push(state);
            if self.fail {
                Err(anyhow!("coordinator fault"))
            } else {
                Ok(())
            }
        }
    }

    fn machine(fail: bool) -> (PlayStateMachine, Arc<Mutex<Recorded>>) {
        let log = Arc::new(Mutex::new(Recorded::default()));
        let coordinator = RecordingCoordinator {
            log: log.clone(),
            fail,
        };
        let machine = PlayStateMachine::new(
            AudioRingBuffers::new(64),
            Arc::new(MidiRingBuffer::new(8)),
            Box::new(coordinator),
            PublicEvents::new(),
        );
        (machine, log)
    }

    /// Simulate the engine publishing its parameters and reporting a start.
    fn started(machine: &mut PlayStateMachine) {
        let s = machine.shared_state();
        s.set(StateField::Nchnls, 2);
        s.set(StateField::NchnlsI, 0);
        s.set(StateField::SampleRate, 44100);
        s.set(StateField::HwBufferSize, 512);
        s.set(StateField::IsPerforming, 1);
        machine.on_play_state_change(PlayState::RealtimePerformanceStarted);
    }

    #[test]
    fn test_start_configures_coordinator() {
        let (mut machine, log) = machine(false);
        let start = machine.arm_start().unwrap();
        started(&mut machine);

        let log = log.lock();
        let params = &log.params[0];
        assert_eq!(params.output_count, 2);
        assert_eq!(params.input_count, 0);
        assert_eq!(params.sample_rate, 44100);
        assert_eq!(params.hw_buffer_size, 512);
        assert!(!params.is_requesting_input);
        assert!(!params.is_requesting_midi);
        assert_eq!(log.states, vec![PlayState::RealtimePerformanceStarted]);
        assert_eq!(start.try_recv().unwrap(), PlayState::RealtimePerformanceStarted);
    }

    #[test]
    fn test_start_resolved_by_other_state() {
        let (mut machine, log) = machine(false);
        let start = machine.arm_start().unwrap();
        machine.on_play_state_change(PlayState::RenderStarted);
        assert_eq!(start.try_recv().unwrap(), PlayState::RenderStarted);
        assert!(log.lock().params.is_empty());
    }

    #[test]
    fn test_end_reinitializes_and_resolves_stop() {
        let (mut machine, _log) = machine(false);
        started(&mut machine);
        let ended = Arc::new(Mutex::new(0));
        let counter = ended.clone();
        machine
            .events()
            .add_listener(EventKind::RealtimePerformanceEnded, move |_| *counter.lock() += 1);

        let stop = machine.request_stop().unwrap().unwrap();
        assert!(stop.try_recv().is_err());
        machine.on_play_state_change(PlayState::RealtimePerformanceEnded);

        assert_eq!(stop.try_recv().unwrap(), PlayState::RealtimePerformanceEnded);
        assert!(machine.shared_state().is_pristine());
        assert_eq!(*ended.lock(), 1);
    }

    #[test]
    fn test_stop_from_non_stoppable_state_writes_nothing() {
        let (mut machine, _log) = machine(false);
        let before = machine.shared_state().snapshot();
        assert!(machine.request_stop().unwrap().is_none());
        assert_eq!(machine.shared_state().snapshot(), before);

        machine.on_play_state_change(PlayState::RealtimePerformanceEnded);
        assert!(machine.request_stop().unwrap().is_none());
    }

    #[test]
    fn test_stop_while_paused() {
        let (mut machine, _log) = machine(false);
        started(&mut machine);
        assert!(machine.pause());
        let state = machine.shared_state();

        let waiter_state = state.clone();
        let waiter = std::thread::spawn(move || {
            waiter_state.wait(StateField::IsPaused, 1, Duration::from_secs(5))
        });
        std::thread::sleep(Duration::from_millis(20));

        let stop = machine.request_stop().unwrap().unwrap();
        assert_ne!(waiter.join().unwrap(), WaitResult::TimedOut);
        assert_eq!(state.get(StateField::IsPaused), 0);
        assert_eq!(state.get(StateField::Stop), 1);
        assert_eq!(state.get(StateField::IsPerforming), 0);
        assert_eq!(state.get(StateField::AtomicNotify), 1);
        assert!(stop.try_recv().is_err());

        machine.on_play_state_change(PlayState::RealtimePerformanceEnded);
        assert!(stop.try_recv().is_ok());
    }

    #[test]
    fn test_render_stop_skips_atomic_notify() {
        let (mut machine, _log) = machine(false);
        machine.on_play_state_change(PlayState::RenderStarted);
        machine.request_stop().unwrap().unwrap();
        let state = machine.shared_state();
        assert_eq!(state.get(StateField::Stop), 1);
        assert_eq!(state.get(StateField::AtomicNotify), 0);
    }

    #[test]
    fn test_pause_resume_sequence() {
        let (mut machine, _log) = machine(false);
        assert!(!machine.pause());
        started(&mut machine);
        let state = machine.shared_state();

        assert!(!machine.resume());
        assert!(machine.pause());
        assert!(!machine.pause());
        assert_eq!(state.get(StateField::IsPaused), 1);
        assert_eq!(machine.current(), PlayState::RealtimePerformancePaused);
        assert!(machine.resume());
        assert_eq!(state.get(StateField::IsPaused), 0);
        assert_eq!(machine.current(), PlayState::RealtimePerformanceResumed);

        state.set(StateField::Stop, 1);
        assert!(!machine.pause());
        assert_eq!(state.get(StateField::IsPaused), 0);
    }

    #[test]
    fn test_coordinator_failure_does_not_stop_machine() {
        let (mut machine, log) = machine(true);
        let start = machine.arm_start().unwrap();
        started(&mut machine);
        assert_eq!(machine.current(), PlayState::RealtimePerformanceStarted);
        assert!(start.try_recv().is_ok());
        machine.on_play_state_change(PlayState::RealtimePerformanceEnded);
        assert_eq!(log.lock().states.len(), 2);
    }

    #[test]
    fn test_disconnect_fails_pending_and_later_requests() {
        let (mut machine, _log) = machine(false);
        started(&mut machine);
        let stop = machine.request_stop().unwrap().unwrap();

        machine.mark_disconnected();
        assert!(stop.recv_timeout(Duration::from_secs(1)).is_err());
        assert!(matches!(machine.request_stop(), Err(Error::Disconnected)));
        assert!(matches!(machine.arm_start(), Err(Error::Disconnected)));
        assert!(machine.is_disconnected());
    }

    #[test]
    fn test_end_reinitializes_after_coordinator_join() {
        struct LateCycle {
            state: Option<Arc<SharedStateRegion>>,
        }

        impl RenderCoordinator for LateCycle {
            fn configure(&mut self, params: RenderParameters) -> anyhow::Result<()> {
                self.state = Some(params.io.state);
                Ok(())
            }

            fn on_play_state_change(&mut self, state: PlayState) -> anyhow::Result<()> {
                // A cycle finishing while its loop is being joined
                if state.is_ended() {
                    if let Some(region) = &self.state {
                        region.set(StateField::AtomicNotify, 1);
                    }
                }
                Ok(())
            }
        }

        let mut machine = PlayStateMachine::new(
            AudioRingBuffers::new(64),
            Arc::new(MidiRingBuffer::new(8)),
            Box::new(LateCycle { state: None }),
            PublicEvents::new(),
        );
        started(&mut machine);
        let stop = machine.request_stop().unwrap().unwrap();
        machine.on_play_state_change(PlayState::RealtimePerformanceEnded);

        assert!(stop.try_recv().is_ok());
        assert!(machine.shared_state().is_pristine());
    }

    #[test]
    fn test_replace_shared_state() {
        let (mut machine, _log) = machine(false);
        let old = machine.shared_state();
        old.set(StateField::SampleRate, 8000);
        let fresh = machine.replace_shared_state();
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert!(fresh.is_pristine());
        assert!(Arc::ptr_eq(&machine.io().state, &fresh));
    }
}
