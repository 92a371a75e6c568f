//! The engine seam.
//!
//! A synthesis engine is an external collaborator that lives on its own
//! worker thread and is reached only through [`crate::remote::EngineProxy`].
//! It shares nothing with the control thread except the buffers bundled in
//! [`PerformanceIo`], which it receives when a performance starts.
//!
//! - [`Engine`] - what an engine implementation provides
//! - [`worker`] - the thread that hosts an engine and runs its performance loop
//! - [`sine`] - a small built-in reference engine

pub mod sine;
pub(crate) mod worker;

use crate::audio::AudioRingBuffers;
use crate::config::EngineSettings;
use crate::midi::MidiRingBuffer;
use crate::ops::EngineOp;
use crate::shared_state::SharedStateRegion;
use crate::value::Value;
use anyhow::Result;
use std::sync::Arc;

pub use sine::SineEngine;

/// Shared memory handed to the engine by reference when a performance starts.
#[derive(Debug, Clone)]
pub struct PerformanceIo {
    pub state: Arc<SharedStateRegion>,
    pub audio: AudioRingBuffers,
    pub midi: Arc<MidiRingBuffer>,
}

/// Configuration passed to the remote `initialize` call.
#[derive(Debug, Clone, Default)]
pub struct InitializeConfig {
    /// Defaults the engine starts from.
    pub settings: EngineSettings,
    /// Options applied before anything else, as if by `setOption`.
    pub options: Vec<String>,
}

/// Whether a started performance is driven by the render thread or runs
/// on its own as fast as possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    Realtime,
    Offline,
}

/// Result of one engine processing block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Continue,
    /// The score is exhausted; the performance ends.
    Finished,
}

/// A synthesis engine hosted on the worker thread.
pub trait Engine: Send {
    /// Prepare a performance.
    ///
    /// Must publish `SampleRate`, `Ksmps`, `Nchnls`, `NchnlsI`,
    /// `HwBufferSize`, `SwBufferSize` and `IsRequestingRtmidi` into
    /// `io.state`. Returns 0 on success, any other status aborts the start.
    fn start(&mut self, io: &PerformanceIo) -> Result<i32>;

    /// Mode of the performance prepared by the last `start`.
    fn mode(&self) -> RenderMode;

    /// Produce one block (`ksmps` frames).
    ///
    /// Realtime engines write interleaved output to `io.audio.output`;
    /// offline engines write to their own sink.
    fn perform_block(&mut self, io: &PerformanceIo) -> Result<BlockStatus>;

    /// Release performance resources after it ended or was stopped.
    fn cleanup(&mut self, io: &PerformanceIo) -> Result<()>;

    /// Return to a freshly created state. Returns a status code.
    fn reset(&mut self) -> Result<i32>;

    /// Execute a generic operation. Arity is checked by the caller.
    fn call(&mut self, op: EngineOp, args: &[Value]) -> Result<Value>;

    /// Console output produced since the last call.
    fn drain_messages(&mut self) -> Vec<String> {
        Vec::new()
    }
}

/// Builds the engine instance inside the worker on `initialize`.
pub type EngineFactory = Box<dyn FnMut(&InitializeConfig) -> Result<Box<dyn Engine>> + Send>;
