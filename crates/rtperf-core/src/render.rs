//! Software render coordinator.
//!
//! [`RenderThread`] stands in for an audio device callback. When a realtime
//! performance starts it spawns a render loop that, once per cycle:
//! - waits on `IS_PAUSED` while the performance is paused
//! - drains queued MIDI into the MIDI handler when the engine asked for MIDI
//! - reads one hardware buffer of output and hands it to the output sink
//! - fills one hardware buffer of input from the input source, if requested
//! - sets and notifies `ATOMIC_NOTIFY` to mark the cycle boundary
//!
//! The loop exits on `STOP` or once `IS_PERFORMING` drops to 0, and is joined
//! when the performance ends. Blocks are allocated before the loop starts.

use crate::config::RenderSettings;
use crate::coordinator::{RenderCoordinator, RenderParameters};
use crate::midi::MidiEvent;
use crate::play_state::PlayState;
use crate::shared_state::StateField;
use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Upper bound on one `IS_PAUSED` wait before the loop re-checks `STOP`.
const PAUSE_WAIT: Duration = Duration::from_millis(100);

/// Receives each rendered block, interleaved, with its channel count.
pub type OutputSink = Box<dyn FnMut(&[f64], usize) + Send>;
/// Fills each input block, interleaved, with its channel count.
pub type InputSource = Box<dyn FnMut(&mut [f64], usize) + Send>;
/// Receives MIDI events drained from the ring.
pub type MidiHandler = Box<dyn FnMut(MidiEvent) + Send>;

/// Callbacks the render loop borrows for the duration of a performance.
#[derive(Default)]
struct Callbacks {
    output: Option<OutputSink>,
    input: Option<InputSource>,
    midi: Option<MidiHandler>,
}

pub struct RenderThread {
    realtime_clock: bool,
    params: Option<RenderParameters>,
    /// `None` while lent to a running loop.
    callbacks: Option<Callbacks>,
    running: Option<JoinHandle<Callbacks>>,
    cycles: Arc<AtomicU64>,
}

impl RenderThread {
    pub fn new(settings: &RenderSettings) -> Self {
        Self {
            realtime_clock: settings.realtime_clock,
            params: None,
            callbacks: Some(Callbacks::default()),
            running: None,
            cycles: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Send every rendered block to `sink`.
    pub fn with_output<F>(mut self, sink: F) -> Self
    where
        F: FnMut(&[f64], usize) + Send + 'static,
    {
        if let Some(callbacks) = self.callbacks.as_mut() {
            callbacks.output = Some(Box::new(sink));
        }
        self
    }

    /// Fill input blocks from `source` when the engine requests input.
    pub fn with_input<F>(mut self, source: F) -> Self
    where
        F: FnMut(&mut [f64], usize) + Send + 'static,
    {
        if let Some(callbacks) = self.callbacks.as_mut() {
            callbacks.input = Some(Box::new(source));
        }
        self
    }

    /// Deliver drained MIDI events to `handler`.
    pub fn with_midi<F>(mut self, handler: F) -> Self
    where
        F: FnMut(MidiEvent) + Send + 'static,
    {
        if let Some(callbacks) = self.callbacks.as_mut() {
            callbacks.midi = Some(Box::new(handler));
        }
        self
    }

    /// Shared count of completed render cycles.
    pub fn cycle_counter(&self) -> Arc<AtomicU64> {
        self.cycles.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    fn spawn(&mut self) -> Result<()> {
        let params = self
            .params
            .clone()
            .ok_or_else(|| anyhow!("render thread started before it was configured"))?;
        let callbacks = self
            .callbacks
            .take()
            .ok_or_else(|| anyhow!("render callbacks were lost"))?;
        let realtime_clock = self.realtime_clock;
        let cycles = self.cycles.clone();

        let handle = thread::Builder::new()
            .name("rtperf-render".to_string())
            .spawn(move || render_loop(params, callbacks, realtime_clock, cycles))?;
        self.running = Some(handle);
        log::info!("Render thread started");
        Ok(())
    }

    fn join(&mut self) -> Result<()> {
        let Some(handle) = self.running.take() else {
            return Ok(());
        };
        match handle.join() {
            Ok(callbacks) => {
                self.callbacks = Some(callbacks);
                log::info!(
                    "Render thread finished after {} cycles",
                    self.cycles.load(Ordering::Relaxed)
                );
                Ok(())
            }
            Err(_) => {
                self.callbacks = Some(Callbacks::default());
                Err(anyhow!("render thread panicked"))
            }
        }
    }
}

impl RenderCoordinator for RenderThread {
    fn configure(&mut self, params: RenderParameters) -> Result<()> {
        if params.output_count <= 0 || params.hw_buffer_size <= 0 || params.sample_rate <= 0 {
            return Err(anyhow!(
                "unusable render parameters: {} Hz, {} channels, {} frames",
                params.sample_rate,
                params.output_count,
                params.hw_buffer_size
            ));
        }
        self.params = Some(params);
        Ok(())
    }

    fn on_play_state_change(&mut self, state: PlayState) -> Result<()> {
        match state {
            PlayState::RealtimePerformanceStarted => {
                self.join()?;
                self.spawn()
            }
            PlayState::RealtimePerformanceEnded | PlayState::RenderEnded | PlayState::Stopped => {
                self.join()
            }
            _ => Ok(()),
        }
    }
}

impl Drop for RenderThread {
    fn drop(&mut self) {
        if let Some(params) = &self.params {
            params.io.state.set(StateField::Stop, 1);
            params.io.state.notify_all(StateField::IsPaused);
        }
        if let Err(e) = self.join() {
            log::error!("{:#}", e);
        }
    }
}

impl std::fmt::Debug for RenderThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderThread")
            .field("realtime_clock", &self.realtime_clock)
            .field("running", &self.running.is_some())
            .field("cycles", &self.cycles.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn render_loop(
    params: RenderParameters,
    mut callbacks: Callbacks,
    realtime_clock: bool,
    cycles: Arc<AtomicU64>,
) -> Callbacks {
    let state = params.io.state.clone();
    let audio = params.io.audio.clone();
    let midi = params.io.midi.clone();

    let frames = params.hw_buffer_size as usize;
    let out_channels = params.output_count as usize;
    let in_channels = params.input_count.max(0) as usize;
    let mut output = vec![0.0; frames * out_channels];
    let mut input = vec![0.0; frames * in_channels];
    let period = Duration::from_secs_f64(frames as f64 / params.sample_rate as f64);
    let mut deadline = Instant::now();
    cycles.store(0, Ordering::Relaxed);

    log::debug!(
        "Render loop: {} frames x {} channels, input {}, midi {}",
        frames,
        out_channels,
        params.is_requesting_input,
        params.is_requesting_midi
    );

    loop {
        if state.is_set(StateField::Stop) || state.get(StateField::IsPerforming) == 0 {
            break;
        }
        if state.is_set(StateField::IsPaused) {
            state.wait(StateField::IsPaused, 1, PAUSE_WAIT);
            deadline = Instant::now();
            continue;
        }

        if params.is_requesting_midi {
            if let Some(handler) = callbacks.midi.as_mut() {
                midi.drain(&state, |event| handler(event));
            }
        }

        let read = audio.output.read(&mut output);
        output[read..].fill(0.0);
        if let Some(sink) = callbacks.output.as_mut() {
            sink(&output, out_channels);
        }

        if params.is_requesting_input {
            if let Some(source) = callbacks.input.as_mut() {
                source(&mut input, in_channels);
            }
            audio.input.write(&input);
        }

        state.set(StateField::AtomicNotify, 1);
        state.notify_all(StateField::AtomicNotify);
        cycles.fetch_add(1, Ordering::Relaxed);

        if realtime_clock {
            deadline += period;
            let now = Instant::now();
            if deadline > now {
                thread::sleep(deadline - now);
            } else {
                deadline = now;
            }
        }
    }
    callbacks
}
