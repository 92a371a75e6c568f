//! Engine worker thread.
//!
//! Hosts one engine instance and services remote calls strictly in arrival
//! order. While a performance is active the worker alternates between
//! draining queued calls and running engine blocks, so control calls land
//! between blocks and never in the middle of one.

use super::{BlockStatus, Engine, EngineFactory, InitializeConfig, PerformanceIo, RenderMode};
use crate::ops::EngineOp;
use crate::play_state::PlayState;
use crate::remote::{CallReply, InstanceHandle, RemoteCall, Request, WorkerEvent};
use crate::shared_state::{StateField, WaitResult};
use crate::value::Value;
use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use std::time::Duration;

/// Re-check interval while the performance is paused.
const PAUSE_POLL: Duration = Duration::from_millis(20);
/// Re-check interval while the output ring is full.
const CYCLE_POLL: Duration = Duration::from_millis(10);

struct ActivePerformance {
    io: PerformanceIo,
    mode: RenderMode,
}

pub(crate) struct EngineWorker {
    factory: EngineFactory,
    engine: Option<Box<dyn Engine>>,
    /// Handle of the current engine instance; 0 before the first initialize.
    instance: i64,
    active: Option<ActivePerformance>,
    calls: Receiver<RemoteCall>,
    replies: Sender<CallReply>,
    events: Sender<WorkerEvent>,
}

impl EngineWorker {
    pub(crate) fn new(
        factory: EngineFactory,
        calls: Receiver<RemoteCall>,
        replies: Sender<CallReply>,
        events: Sender<WorkerEvent>,
    ) -> Self {
        Self {
            factory,
            engine: None,
            instance: 0,
            active: None,
            calls,
            replies,
            events,
        }
    }

    pub(crate) fn run(mut self) {
        log::debug!("Engine worker started");
        loop {
            let call = if self.active.is_some() {
                match self.calls.try_recv() {
                    Ok(call) => Some(call),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => break,
                }
            } else {
                match self.calls.recv() {
                    Ok(call) => Some(call),
                    Err(_) => break,
                }
            };

            match call {
                Some(call) => {
                    if !self.handle(call) {
                        break;
                    }
                }
                None => self.step(),
            }
        }
        self.finish_active();
        log::debug!("Engine worker exiting");
    }

    /// Service one call. Returns false on shutdown.
    fn handle(&mut self, call: RemoteCall) -> bool {
        let RemoteCall { uid, request } = call;
        let value = match request {
            Request::Shutdown => return false,
            Request::Initialize(config) => Ok(self.initialize(&config)),
            Request::Start { instance, io } => self.start(instance, io),
            Request::Reset { instance } => self.reset(instance),
            Request::Call { instance, op, args } => self.call(instance, op, &args),
        };
        self.forward_messages();

        let value = value.map_err(|e| format!("{:#}", e));
        if self.replies.send(CallReply { uid, value }).is_err() {
            log::warn!("Reply channel closed, dropping reply {}", uid);
        }
        true
    }

    fn initialize(&mut self, config: &InitializeConfig) -> Value {
        self.finish_active();
        match (self.factory)(config) {
            Ok(engine) => {
                self.engine = Some(engine);
                self.instance += 1;
                log::info!("Engine instance {} created", self.instance);
                Value::Int(self.instance)
            }
            Err(e) => {
                log::error!("Engine creation failed: {:#}", e);
                self.engine = None;
                Value::Unit
            }
        }
    }

    fn engine_mut(&mut self, instance: InstanceHandle) -> Result<&mut Box<dyn Engine>> {
        if instance.0 != self.instance {
            return Err(anyhow!("unknown engine instance {}", instance.0));
        }
        self.engine
            .as_mut()
            .ok_or_else(|| anyhow!("engine instance {} is gone", instance.0))
    }

    fn start(&mut self, instance: InstanceHandle, io: PerformanceIo) -> Result<Value> {
        if self.active.is_some() {
            log::warn!("start ignored, a performance is already running");
            return Ok(Value::Int(-1));
        }
        let (status, mode) = {
            let engine = self.engine_mut(instance)?;
            let status = engine.start(&io)?;
            (status, engine.mode())
        };
        if status != 0 {
            log::error!("Engine refused to start (status {})", status);
            return Ok(Value::Int(status as i64));
        }

        io.audio.clear();
        let started = match mode {
            RenderMode::Realtime => {
                io.state.set(StateField::IsPerforming, 1);
                PlayState::RealtimePerformanceStarted
            }
            RenderMode::Offline => {
                io.state.set(StateField::IsRendering, 1);
                PlayState::RenderStarted
            }
        };
        self.active = Some(ActivePerformance { io, mode });
        self.report(started);
        Ok(Value::Int(0))
    }

    fn reset(&mut self, instance: InstanceHandle) -> Result<Value> {
        self.finish_active();
        let status = self.engine_mut(instance)?.reset()?;
        Ok(Value::Int(status as i64))
    }

    fn call(&mut self, instance: InstanceHandle, op: EngineOp, args: &[Value]) -> Result<Value> {
        self.engine_mut(instance)?.call(op, args)
    }

    /// Advance the active performance by at most one block.
    fn step(&mut self) {
        let Some(active) = &self.active else {
            return;
        };
        let io = active.io.clone();
        let mode = active.mode;
        let state = &io.state;

        let stopped = state.is_set(StateField::Stop)
            || (mode == RenderMode::Realtime && state.get(StateField::IsPerforming) == 0);
        if stopped {
            self.finish_active();
            return;
        }

        if state.is_set(StateField::IsPaused) {
            state.wait(StateField::IsPaused, 1, PAUSE_POLL);
            return;
        }

        if mode == RenderMode::Realtime && output_is_full(&io) {
            // Sleep until the render thread reports a cycle boundary
            if state.wait(StateField::AtomicNotify, 0, CYCLE_POLL) != WaitResult::TimedOut {
                state.set(StateField::AtomicNotify, 0);
            }
            return;
        }

        let Some(engine) = self.engine.as_mut() else {
            self.finish_active();
            return;
        };
        match engine.perform_block(&io) {
            Ok(BlockStatus::Continue) if mode == RenderMode::Offline => {
                // Offline there is no render thread; the block boundary is ours
                state.set(StateField::AtomicNotify, 1);
                state.notify_all(StateField::AtomicNotify);
            }
            Ok(BlockStatus::Continue) => {}
            Ok(BlockStatus::Finished) => {
                log::info!("Performance finished");
                self.finish_active();
            }
            Err(e) => {
                log::error!("Engine block failed, ending performance: {:#}", e);
                self.finish_active();
            }
        }
        self.forward_messages();
    }

    /// End the active performance, if any, and report it.
    fn finish_active(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        if let Some(engine) = self.engine.as_mut() {
            if let Err(e) = engine.cleanup(&active.io) {
                log::error!("Engine cleanup failed: {:#}", e);
            }
        }
        active.io.state.set(StateField::IsPerforming, 0);
        active.io.state.set(StateField::IsRendering, 0);
        self.forward_messages();
        self.report(match active.mode {
            RenderMode::Realtime => PlayState::RealtimePerformanceEnded,
            RenderMode::Offline => PlayState::RenderEnded,
        });
    }

    fn report(&self, state: PlayState) {
        log::debug!("Worker reporting {}", state);
        let _ = self.events.send(WorkerEvent::PlayState(state));
    }

    fn forward_messages(&mut self) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        for message in engine.drain_messages() {
            let _ = self.events.send(WorkerEvent::Message(message));
        }
    }
}

/// True when the engine is a full hardware plus software buffer ahead.
fn output_is_full(io: &PerformanceIo) -> bool {
    let state = &io.state;
    let frames = state.get(StateField::HwBufferSize) + state.get(StateField::SwBufferSize);
    let frames = frames.max(1) as usize;
    let channels = state.get(StateField::Nchnls).max(1) as usize;
    let target = (frames * channels).min(io.audio.output.capacity());
    io.audio.output.available() >= target
}
