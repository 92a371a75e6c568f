//! Render coordinator seam.
//!
//! The coordinator drives the realtime audio callback. It never sees the
//! orchestrator: the state machine hands it the render parameters (including
//! the shared buffers) when a realtime performance starts, and forwards every
//! play-state transition to it afterwards.

use crate::engine::PerformanceIo;
use crate::play_state::PlayState;
use anyhow::Result;

/// Everything the coordinator needs to run render cycles.
#[derive(Debug, Clone)]
pub struct RenderParameters {
    pub sample_rate: i32,
    pub input_count: i32,
    pub output_count: i32,
    /// Frames per render cycle.
    pub hw_buffer_size: i32,
    pub sw_buffer_size: i32,
    pub is_requesting_input: bool,
    pub is_requesting_midi: bool,
    pub io: PerformanceIo,
}

/// The realtime-thread-facing collaborator.
///
/// Both methods run on the engine event dispatcher while the state machine
/// is locked; they must not call back into blocking
/// [`crate::Performance`] operations.
pub trait RenderCoordinator: Send {
    /// Called on entry to `realtimePerformanceStarted`, before the transition
    /// itself is forwarded.
    fn configure(&mut self, params: RenderParameters) -> Result<()>;

    /// Called after the state machine handled a transition. Errors are
    /// logged by the caller and otherwise ignored.
    fn on_play_state_change(&mut self, state: PlayState) -> Result<()>;
}

/// Coordinator for headless use; accepts everything and renders nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCoordinator;

impl RenderCoordinator for NullCoordinator {
    fn configure(&mut self, params: RenderParameters) -> Result<()> {
        log::debug!(
            "NullCoordinator configured: {} Hz, {} out / {} in",
            params.sample_rate,
            params.output_count,
            params.input_count
        );
        Ok(())
    }

    fn on_play_state_change(&mut self, _state: PlayState) -> Result<()> {
        Ok(())
    }
}
