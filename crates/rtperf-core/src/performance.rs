//! The control-thread orchestrator.
//!
//! [`Performance`] composes the shared buffers, the play-state machine, the
//! engine proxy and the public event sink into one API:
//!
//! - `start`, `stop` and `reset` are choreographed lifecycle calls
//! - every other engine operation goes through [`Performance::invoke`], with
//!   one typed method per operation generated in [`crate::ops`]
//! - `pause`, `resume` and `handle_midi_input` act on shared memory directly
//!
//! A dispatcher thread consumes the worker's events and feeds play-state
//! transitions to the machine, so lifecycle completions are resolved even
//! while the control thread is blocked in `start` or `stop`.

use crate::audio::AudioRingBuffers;
use crate::config::Config;
use crate::coordinator::RenderCoordinator;
use crate::engine::{EngineFactory, InitializeConfig};
use crate::error::{Error, Result};
use crate::events::{EventKind, PerformanceEvent, PublicEvents};
use crate::machine::PlayStateMachine;
use crate::midi::{MidiEvent, MidiRingBuffer};
use crate::ops::{Dispatch, EngineOp, OperationTable};
use crate::play_state::PlayState;
use crate::remote::{EngineProxy, InstanceHandle, WorkerEvent};
use crate::shared_state::{SharedStateRegion, StateField, WaitResult};
use crate::value::Value;
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub struct Performance {
    proxy: EngineProxy,
    instance: Option<InstanceHandle>,
    machine: Arc<Mutex<PlayStateMachine>>,
    events: PublicEvents,
    buffers: AudioRingBuffers,
    midi: Arc<MidiRingBuffer>,
    operations: OperationTable,
    call_wait_timeout: Duration,
    dispatcher: Option<JoinHandle<()>>,
}

impl Performance {
    /// Allocate the shared buffers, spawn the engine worker and create the
    /// engine instance.
    ///
    /// A factory that fails leaves the performance without an instance:
    /// `start` then logs and returns -1.
    ///
    /// # Arguments
    /// * `factory` - Builds the engine inside the worker
    /// * `config` - Buffer sizes, call timeout and engine defaults
    /// * `coordinator` - Receives render parameters and play-state changes
    pub fn initialize(
        factory: EngineFactory,
        config: &Config,
        coordinator: Box<dyn RenderCoordinator>,
    ) -> Result<Self> {
        config.validate()?;
        log::info!("Initializing performance");

        let buffers = AudioRingBuffers::new(config.buffers.audio_ring_samples());
        let midi = Arc::new(MidiRingBuffer::new(config.buffers.midi_capacity));

        let events = PublicEvents::new();
        events.add_listener(EventKind::Message, |event| {
            if let PerformanceEvent::Message(text) = event {
                log::info!("[engine] {}", text);
            }
        });

        let machine = Arc::new(Mutex::new(PlayStateMachine::new(
            buffers.clone(),
            midi.clone(),
            coordinator,
            events.clone(),
        )));

        let (proxy, worker_events) = EngineProxy::spawn(factory)?;
        let dispatcher = {
            let machine = machine.clone();
            let events = events.clone();
            thread::Builder::new()
                .name("rtperf-events".to_string())
                .spawn(move || dispatch_events(worker_events, machine, events))?
        };

        let instance = proxy.initialize(InitializeConfig {
            settings: config.engine.clone(),
            options: Vec::new(),
        })?;
        match instance {
            Some(handle) => log::info!("Engine instance {} ready", handle.0),
            None => log::error!("Engine instance could not be created"),
        }

        Ok(Self {
            proxy,
            instance,
            machine,
            events,
            buffers,
            midi,
            operations: OperationTable::build(),
            call_wait_timeout: config.control.call_wait_timeout(),
            dispatcher: Some(dispatcher),
        })
    }

    /// Start a performance and wait until the worker reports it began.
    ///
    /// Returns the engine's start status; non-zero statuses return at once.
    pub fn start(&self) -> Result<i32> {
        let Some(instance) = self.instance else {
            log::error!("start failed: no engine instance");
            return Ok(-1);
        };

        let (started, io) = {
            let mut machine = self.machine.lock();
            (machine.arm_start()?, machine.io())
        };
        let status = match self.proxy.start(instance, io) {
            Ok(value) => value.as_status(),
            Err(e) => {
                self.machine.lock().disarm_start();
                return Err(e);
            }
        };
        if status != 0 {
            self.machine.lock().disarm_start();
            log::error!("Engine start returned {}", status);
            return Ok(status);
        }

        let state = started.recv().map_err(|_| Error::Disconnected)?;
        log::info!("Performance started ({})", state);
        Ok(status)
    }

    /// Stop the running performance and wait until the worker reports it
    /// ended. Returns -1 without side effects when nothing is stoppable, and
    /// [`Error::Disconnected`] when the worker is gone.
    pub fn stop(&self) -> Result<i32> {
        let request = self.machine.lock().request_stop()?;
        let Some(stopped) = request else {
            log::debug!("stop ignored in state {}", self.play_state());
            return Ok(-1);
        };
        let state = stopped.recv().map_err(|_| Error::Disconnected)?;
        log::info!("Performance stopped ({})", state);
        Ok(0)
    }

    /// Stop if needed, reset the engine and start over on a fresh region.
    pub fn reset(&self) -> Result<i32> {
        if self.play_state().is_stoppable() {
            self.stop()?;
        }
        let Some(instance) = self.instance else {
            log::error!("reset failed: no engine instance");
            return Ok(-1);
        };
        let status = self.proxy.reset(instance)?.as_status();

        let mut machine = self.machine.lock();
        machine.replace_shared_state();
        machine.on_play_state_change(PlayState::Stopped);
        log::info!("Performance reset (status {})", status);
        Ok(status)
    }

    /// Pause the running performance. Returns false when ignored.
    pub fn pause(&self) -> bool {
        self.machine.lock().pause()
    }

    /// Resume a paused performance. Returns false when ignored.
    pub fn resume(&self) -> bool {
        self.machine.lock().resume()
    }

    /// Queue a MIDI message for the render thread. Returns false when the
    /// ring is full and the event was dropped.
    pub fn handle_midi_input(&self, status: i32, data1: i32, data2: i32) -> bool {
        let state = self.shared_state();
        let queued = self.midi.enqueue(&state, MidiEvent::new(status, data1, data2));
        if !queued {
            log::warn!("MIDI ring full, dropped event {:#04x}", status);
        }
        queued
    }

    /// Dispatch a generic operation.
    ///
    /// Guarded operations wait for the render cycle boundary while a
    /// performance or render is active; `Ok(None)` means the call was
    /// dropped (the wait timed out, or the performance already ended).
    pub fn invoke(&self, op: EngineOp, args: Vec<Value>) -> Result<Option<Value>> {
        if op.dispatch() == Dispatch::Guarded {
            let (current, state) = {
                let machine = self.machine.lock();
                (machine.current(), machine.shared_state())
            };
            if current.is_active() {
                let waited = state.wait(StateField::AtomicNotify, 0, self.call_wait_timeout);
                if waited == WaitResult::TimedOut {
                    log::error!("Worker timed out so {}() wasn't called", op.name());
                    return Ok(None);
                }
            } else if current.is_ended() {
                log::error!("{} was called after performance ended", op.name());
                return Ok(None);
            }
        }

        let instance = self.instance.ok_or_else(|| Error::Remote {
            op: op.name().to_string(),
            message: "no engine instance".to_string(),
        })?;
        self.proxy.call(instance, op, args).map(Some)
    }

    /// Dispatch an operation by wire name, checking its arity.
    pub fn call(&self, name: &str, args: Vec<Value>) -> Result<Option<Value>> {
        let op = self
            .operations
            .lookup(name)
            .ok_or_else(|| Error::UnknownOperation(name.to_string()))?;
        if args.len() != op.arity() {
            return Err(Error::Arity {
                op: op.name(),
                expected: op.arity(),
                got: args.len(),
            });
        }
        self.invoke(op, args)
    }

    pub fn play_state(&self) -> PlayState {
        self.machine.lock().current()
    }

    /// Current shared state region. A new region is allocated on reset.
    pub fn shared_state(&self) -> Arc<SharedStateRegion> {
        self.machine.lock().shared_state()
    }

    pub fn events(&self) -> &PublicEvents {
        &self.events
    }

    pub fn buffers(&self) -> &AudioRingBuffers {
        &self.buffers
    }

    pub fn midi(&self) -> &Arc<MidiRingBuffer> {
        &self.midi
    }

    pub fn operations(&self) -> &OperationTable {
        &self.operations
    }

    pub fn instance(&self) -> Option<InstanceHandle> {
        self.instance
    }
}

impl Drop for Performance {
    fn drop(&mut self) {
        self.proxy.shutdown();
        if let Some(dispatcher) = self.dispatcher.take() {
            if dispatcher.join().is_err() {
                log::error!("Event dispatcher panicked");
            }
        }
    }
}

impl std::fmt::Debug for Performance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Performance")
            .field("instance", &self.instance)
            .field("play_state", &self.play_state())
            .finish_non_exhaustive()
    }
}

/// Feed worker events to the machine and the message listeners until the
/// worker exits.
fn dispatch_events(
    worker_events: Receiver<WorkerEvent>,
    machine: Arc<Mutex<PlayStateMachine>>,
    events: PublicEvents,
) {
    for event in worker_events.iter() {
        match event {
            WorkerEvent::PlayState(state) => machine.lock().on_play_state_change(state),
            WorkerEvent::Message(text) => events.emit(&PerformanceEvent::Message(text)),
        }
    }
    machine.lock().mark_disconnected();
    log::debug!("Event dispatcher exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::NullCoordinator;
    use crate::engine::{Engine, SineEngine};
    use anyhow::anyhow;
    use crossbeam_channel::unbounded;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.buffers.max_channels = 2;
        config.buffers.max_hardware_buffer_size = 8192;
        config.engine.hardware_buffer_size = 256;
        config.engine.software_buffer_size = 64;
        config.control.call_wait_timeout_ms = 50;
        config
    }

    fn performance() -> Performance {
        let _ = env_logger::builder().is_test(true).try_init();
        Performance::initialize(SineEngine::factory(), &test_config(), Box::new(NullCoordinator))
            .unwrap()
    }

    #[test]
    fn test_start_and_stop() {
        let perf = performance();
        assert_eq!(perf.start().unwrap(), 0);
        assert_eq!(perf.play_state(), PlayState::RealtimePerformanceStarted);
        assert_eq!(perf.shared_state().get(StateField::IsPerforming), 1);

        assert_eq!(perf.stop().unwrap(), 0);
        assert_eq!(perf.play_state(), PlayState::RealtimePerformanceEnded);
        assert!(perf.shared_state().is_pristine());
        assert_eq!(perf.stop().unwrap(), -1);
    }

    #[test]
    fn test_stop_when_stopped_writes_nothing() {
        let perf = performance();
        let before = perf.shared_state().snapshot();
        assert_eq!(perf.stop().unwrap(), -1);
        assert_eq!(perf.shared_state().snapshot(), before);
    }

    #[test]
    fn test_stop_while_paused() {
        let perf = performance();
        perf.start().unwrap();
        assert!(perf.pause());
        assert_eq!(perf.shared_state().get(StateField::IsPaused), 1);
        assert_eq!(perf.stop().unwrap(), 0);
        assert_eq!(perf.play_state(), PlayState::RealtimePerformanceEnded);
        assert_eq!(perf.shared_state().get(StateField::IsPaused), 0);
    }

    #[test]
    fn test_pause_and_resume() {
        let perf = performance();
        assert!(!perf.pause());
        perf.start().unwrap();
        assert!(perf.pause());
        assert_eq!(perf.play_state(), PlayState::RealtimePerformancePaused);
        assert!(perf.resume());
        assert_eq!(perf.shared_state().get(StateField::IsPaused), 0);
        assert_eq!(perf.play_state(), PlayState::RealtimePerformanceResumed);
        perf.stop().unwrap();
    }

    #[test]
    fn test_reset_restores_initial_state() {
        let perf = performance();
        perf.start().unwrap();
        let old = perf.shared_state();
        assert_eq!(perf.reset().unwrap(), 0);
        assert_eq!(perf.play_state(), PlayState::Stopped);
        let fresh = perf.shared_state();
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert!(fresh.is_pristine());

        assert_eq!(perf.start().unwrap(), 0);
        assert_eq!(perf.play_state(), PlayState::RealtimePerformanceStarted);
        perf.stop().unwrap();
    }

    #[test]
    fn test_guarded_call_when_idle() {
        let perf = performance();
        assert_eq!(perf.get_sr().unwrap(), Some(Value::Float(44100.0)));
        assert_eq!(perf.set_control_channel("freq", 220.0).unwrap(), Some(Value::Unit));
        assert_eq!(
            perf.call("getControlChannel", vec![Value::from("freq")]).unwrap(),
            Some(Value::Float(220.0))
        );
    }

    #[test]
    fn test_guarded_call_times_out_without_render_cycles() {
        let perf = performance();
        perf.start().unwrap();
        assert_eq!(perf.get_ksmps().unwrap(), None);
        perf.stop().unwrap();
    }

    #[test]
    fn test_guarded_call_dispatched_at_cycle_boundary() {
        let perf = performance();
        perf.start().unwrap();
        let state = perf.shared_state();
        state.set(StateField::AtomicNotify, 1);
        state.notify_all(StateField::AtomicNotify);
        // Either already set (not-equal) or woken by a later notify
        let notifier = {
            let state = state.clone();
            thread::spawn(move || {
                for _ in 0..10 {
                    thread::sleep(Duration::from_millis(5));
                    state.set(StateField::AtomicNotify, 1);
                    state.notify_all(StateField::AtomicNotify);
                }
            })
        };
        assert_eq!(perf.get_ksmps().unwrap(), Some(Value::Int(32)));
        notifier.join().unwrap();
        perf.stop().unwrap();
    }

    #[test]
    fn test_offline_render() {
        let perf = performance();
        let (tx, rx) = unbounded();
        perf.events().add_listener(EventKind::RenderEnded, move |_| {
            let _ = tx.send(());
        });
        perf.set_option("-o/render.wav").unwrap();
        perf.set_option("--duration=0.05").unwrap();

        assert_eq!(perf.start().unwrap(), 0);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(perf.play_state(), PlayState::RenderEnded);

        // Guarded calls are dropped after the end, file system calls are not
        assert_eq!(perf.get_sr().unwrap(), None);
        let listing = perf.ls_fs().unwrap().unwrap();
        assert_eq!(listing, Value::List(vec![Value::from("/render.wav")]));
        let bytes = perf.read_from_fs("/render.wav").unwrap().unwrap();
        assert!(bytes.as_bytes().unwrap().len() > 44);
        assert_eq!(perf.stop().unwrap(), -1);

        perf.reset().unwrap();
        assert_eq!(perf.get_sr().unwrap(), Some(Value::Float(44100.0)));
    }

    #[test]
    fn test_call_by_name_validation() {
        let perf = performance();
        assert!(matches!(
            perf.call("noSuchOp", vec![]),
            Err(Error::UnknownOperation(_))
        ));
        assert!(matches!(
            perf.call("tableGet", vec![Value::from(1i64)]),
            Err(Error::Arity { expected: 2, got: 1, .. })
        ));
        assert!(matches!(
            perf.call("tableGet", vec![Value::from(99i64), Value::from(0i64)]),
            Err(Error::Remote { .. })
        ));
    }

    #[test]
    fn test_midi_input_reaches_ring() {
        let perf = performance();
        assert!(perf.handle_midi_input(0x90, 60, 100));
        assert!(perf.handle_midi_input(0x80, 60, 0));
        let state = perf.shared_state();
        assert_eq!(perf.midi().pending(&state), 2);

        let mut seen = Vec::new();
        perf.midi().drain(&state, |e| seen.push(e));
        assert_eq!(seen, vec![MidiEvent::new(0x90, 60, 100), MidiEvent::new(0x80, 60, 0)]);
    }

    #[test]
    fn test_engine_messages_are_emitted() {
        let perf = performance();
        let (tx, rx) = unbounded();
        perf.events().add_listener(EventKind::Message, move |event| {
            if let PerformanceEvent::Message(text) = event {
                let _ = tx.send(text.clone());
            }
        });
        perf.start().unwrap();
        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(first.starts_with("starting realtime performance"));
        perf.stop().unwrap();
    }

    #[test]
    fn test_missing_instance() {
        let factory: EngineFactory = Box::new(|_| Err(anyhow!("no engine available")));
        let perf =
            Performance::initialize(factory, &test_config(), Box::new(NullCoordinator)).unwrap();
        assert!(perf.instance().is_none());
        assert_eq!(perf.start().unwrap(), -1);
        assert!(matches!(perf.get_sr(), Err(Error::Remote { .. })));
    }

    #[test]
    fn test_failed_engine_start_does_not_hang() {
        struct Refusing;
        impl Engine for Refusing {
            fn start(&mut self, _io: &crate::engine::PerformanceIo) -> anyhow::Result<i32> {
                Ok(-3)
            }
            fn mode(&self) -> crate::engine::RenderMode {
                crate::engine::RenderMode::Realtime
            }
            fn perform_block(
                &mut self,
                _io: &crate::engine::PerformanceIo,
            ) -> anyhow::Result<crate::engine::BlockStatus> {
                Ok(crate::engine::BlockStatus::Finished)
            }
            fn cleanup(&mut self, _io: &crate::engine::PerformanceIo) -> anyhow::Result<()> {
                Ok(())
            }
            fn reset(&mut self) -> anyhow::Result<i32> {
                Ok(0)
            }
            fn call(&mut self, _op: EngineOp, _args: &[Value]) -> anyhow::Result<Value> {
                Ok(Value::Unit)
            }
        }

        let factory: EngineFactory = Box::new(|_| Ok(Box::new(Refusing) as Box<dyn Engine>));
        let perf =
            Performance::initialize(factory, &test_config(), Box::new(NullCoordinator)).unwrap();
        assert_eq!(perf.start().unwrap(), -3);
        assert_eq!(perf.play_state(), PlayState::Stopped);
    }

    struct Crashing;

    impl Engine for Crashing {
        fn start(&mut self, _io: &crate::engine::PerformanceIo) -> anyhow::Result<i32> {
            Ok(0)
        }
        fn mode(&self) -> crate::engine::RenderMode {
            crate::engine::RenderMode::Realtime
        }
        fn perform_block(
            &mut self,
            _io: &crate::engine::PerformanceIo,
        ) -> anyhow::Result<crate::engine::BlockStatus> {
            panic!("engine block crashed");
        }
        fn cleanup(&mut self, _io: &crate::engine::PerformanceIo) -> anyhow::Result<()> {
            Ok(())
        }
        fn reset(&mut self) -> anyhow::Result<i32> {
            Ok(0)
        }
        fn call(&mut self, _op: EngineOp, _args: &[Value]) -> anyhow::Result<Value> {
            Ok(Value::Unit)
        }
    }

    #[test]
    fn test_stop_after_worker_crash_returns_disconnected() {
        let _ = env_logger::builder().is_test(true).try_init();
        let factory: EngineFactory = Box::new(|_| Ok(Box::new(Crashing) as Box<dyn Engine>));
        let perf =
            Performance::initialize(factory, &test_config(), Box::new(NullCoordinator)).unwrap();
        assert_eq!(perf.start().unwrap(), 0);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !perf.machine.lock().is_disconnected() {
            assert!(std::time::Instant::now() < deadline, "worker did not exit");
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(perf.play_state(), PlayState::RealtimePerformanceStarted);

        let (tx, rx) = unbounded();
        let stopper = thread::spawn(move || {
            let _ = tx.send(perf.stop());
            perf
        });
        let result = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("stop blocked after the worker died");
        assert!(matches!(result, Err(Error::Disconnected)));

        let perf = stopper.join().unwrap();
        assert!(matches!(perf.stop(), Err(Error::Disconnected)));
        assert!(matches!(perf.start(), Err(Error::Disconnected)));
    }

    #[test]
    fn test_drop_ends_live_performance() {
        let perf = performance();
        let (tx, rx) = unbounded();
        perf.events()
            .add_listener(EventKind::RealtimePerformanceEnded, move |_| {
                let _ = tx.send(());
            });
        perf.start().unwrap();
        drop(perf);
        assert!(rx.try_recv().is_ok());
    }
}
