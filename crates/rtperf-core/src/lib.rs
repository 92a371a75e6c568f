//! rtperf core - drive a realtime synthesis engine from a control thread.
//!
//! The engine runs on its own worker thread and the audio callback on a
//! render thread. The control thread talks to both without ever blocking the
//! render path:
//!
//! - **Shared state** - a versioned region of atomic integer fields, the only
//!   control-plane channel between threads ([`SharedStateRegion`])
//! - **Ring buffers** - MIDI events from control to render ([`MidiRingBuffer`])
//!   and audio samples between render and engine ([`AudioRingBuffers`])
//! - **Remote calls** - ordered request/reply messaging with the worker-hosted
//!   engine ([`EngineProxy`], [`Engine`])
//! - **Play states** - lifecycle sequencing, render coordinator forwarding and
//!   public events ([`PlayStateMachine`], [`PublicEvents`])
//! - **Orchestrator** - the public API, one method per engine operation plus
//!   the choreographed `start`, `stop` and `reset` ([`Performance`])
//!
//! # Example
//!
//! ```no_run
//! use rtperf_core::{Config, Performance, RenderThread, SineEngine};
//!
//! # fn main() -> rtperf_core::Result<()> {
//! let config = Config::load_or_default();
//! let render = RenderThread::new(&config.render);
//! let perf = Performance::initialize(SineEngine::factory(), &config, Box::new(render))?;
//! perf.start()?;
//! perf.set_control_channel("freq", 330.0)?;
//! perf.stop()?;
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod events;
pub mod machine;
pub mod midi;
pub mod ops;
pub mod performance;
pub mod play_state;
pub mod remote;
pub mod render;
pub mod shared_state;
pub mod value;

pub use audio::{AudioRingBuffer, AudioRingBuffers};
pub use config::Config;
pub use coordinator::{NullCoordinator, RenderCoordinator, RenderParameters};
pub use engine::{Engine, EngineFactory, InitializeConfig, PerformanceIo, SineEngine};
pub use error::{Error, Result};
pub use events::{EventKind, ListenerId, PerformanceEvent, PublicEvents};
pub use machine::PlayStateMachine;
pub use midi::{MidiEvent, MidiRingBuffer};
pub use ops::{Dispatch, EngineOp, OperationTable};
pub use performance::Performance;
pub use play_state::PlayState;
pub use remote::{EngineProxy, InstanceHandle};
pub use render::RenderThread;
pub use shared_state::{SharedStateRegion, StateField, WaitResult, LAYOUT_VERSION};
pub use value::Value;
