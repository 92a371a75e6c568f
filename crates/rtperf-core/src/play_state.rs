//! Play states of a performance.

use std::fmt;
use std::str::FromStr;

/// The current phase of a performance.
///
/// `RealtimePerformance*` states belong to a live performance driven by the
/// render thread; `Render*` states belong to an offline render the engine
/// runs on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PlayState {
    #[default]
    Stopped,
    RealtimePerformanceStarted,
    RealtimePerformancePaused,
    RealtimePerformanceResumed,
    RealtimePerformanceEnded,
    RenderStarted,
    RenderEnded,
}

impl PlayState {
    /// Wire name of the state, also the public event name.
    pub fn as_str(self) -> &'static str {
        match self {
            PlayState::Stopped => "stopped",
            PlayState::RealtimePerformanceStarted => "realtimePerformanceStarted",
            PlayState::RealtimePerformancePaused => "realtimePerformancePaused",
            PlayState::RealtimePerformanceResumed => "realtimePerformanceResumed",
            PlayState::RealtimePerformanceEnded => "realtimePerformanceEnded",
            PlayState::RenderStarted => "renderStarted",
            PlayState::RenderEnded => "renderEnded",
        }
    }

    /// States from which `stop` is permitted.
    pub fn is_stoppable(self) -> bool {
        matches!(
            self,
            PlayState::RealtimePerformanceStarted
                | PlayState::RealtimePerformancePaused
                | PlayState::RealtimePerformanceResumed
                | PlayState::RenderStarted
        )
    }

    /// States in which the engine is running a realtime performance or render.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            PlayState::RealtimePerformanceStarted | PlayState::RenderStarted
        )
    }

    /// Terminal states of a performance.
    pub fn is_ended(self) -> bool {
        matches!(
            self,
            PlayState::RealtimePerformanceEnded | PlayState::RenderEnded
        )
    }
}

impl fmt::Display for PlayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlayState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(PlayState::Stopped),
            "realtimePerformanceStarted" => Ok(PlayState::RealtimePerformanceStarted),
            "realtimePerformancePaused" => Ok(PlayState::RealtimePerformancePaused),
            "realtimePerformanceResumed" => Ok(PlayState::RealtimePerformanceResumed),
            "realtimePerformanceEnded" => Ok(PlayState::RealtimePerformanceEnded),
            "renderStarted" => Ok(PlayState::RenderStarted),
            "renderEnded" => Ok(PlayState::RenderEnded),
            other => Err(format!("unknown play state: {}", other)),
        }
    }
}
