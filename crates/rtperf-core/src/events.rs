//! Public lifecycle events.
//!
//! Consumers subscribe to events by kind (or by wire name) and receive
//! them synchronously on whichever thread emits them: the engine event
//! dispatcher for engine-reported transitions, the control thread for
//! pause and resume. Listeners must not call back into blocking
//! [`crate::Performance`] operations.

use crate::play_state::PlayState;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Subscribable event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    RealtimePerformanceStarted,
    RealtimePerformancePaused,
    RealtimePerformanceResumed,
    RealtimePerformanceEnded,
    RenderStarted,
    RenderEnded,
    /// Console output from the engine.
    Message,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::RealtimePerformanceStarted => "realtimePerformanceStarted",
            EventKind::RealtimePerformancePaused => "realtimePerformancePaused",
            EventKind::RealtimePerformanceResumed => "realtimePerformanceResumed",
            EventKind::RealtimePerformanceEnded => "realtimePerformanceEnded",
            EventKind::RenderStarted => "renderStarted",
            EventKind::RenderEnded => "renderEnded",
            EventKind::Message => "message",
        }
    }

    /// Event kind announced for a play state, if any.
    pub fn for_play_state(state: PlayState) -> Option<Self> {
        match state {
            PlayState::Stopped => None,
            PlayState::RealtimePerformanceStarted => Some(EventKind::RealtimePerformanceStarted),
            PlayState::RealtimePerformancePaused => Some(EventKind::RealtimePerformancePaused),
            PlayState::RealtimePerformanceResumed => Some(EventKind::RealtimePerformanceResumed),
            PlayState::RealtimePerformanceEnded => Some(EventKind::RealtimePerformanceEnded),
            PlayState::RenderStarted => Some(EventKind::RenderStarted),
            PlayState::RenderEnded => Some(EventKind::RenderEnded),
        }
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(EventKind::Message),
            other => other
                .parse::<PlayState>()
                .ok()
                .and_then(EventKind::for_play_state)
                .ok_or_else(|| format!("unknown event: {}", s)),
        }
    }
}

/// An event delivered to listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum PerformanceEvent {
    PlayState(PlayState),
    Message(String),
}

impl PerformanceEvent {
    /// The kind listeners subscribe to, `None` for unannounced states.
    pub fn kind(&self) -> Option<EventKind> {
        match self {
            PerformanceEvent::PlayState(state) => EventKind::for_play_state(*state),
            PerformanceEvent::Message(_) => Some(EventKind::Message),
        }
    }
}

/// Handle returned by [`PublicEvents::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&PerformanceEvent) + Send + Sync>;

/// Listener registry, cheap to clone.
#[derive(Clone, Default)]
pub struct PublicEvents {
    listeners: Arc<RwLock<HashMap<EventKind, Vec<(ListenerId, Listener)>>>>,
    next_id: Arc<AtomicU64>,
}

impl PublicEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `listener` to events of `kind`.
    pub fn add_listener<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&PerformanceEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Unsubscribe one listener. Returns whether it was registered.
    pub fn remove_listener(&self, kind: EventKind, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let Some(list) = listeners.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(lid, _)| *lid != id);
        before != list.len()
    }

    /// Drop every listener of `kind`.
    pub fn remove_all_listeners(&self, kind: EventKind) {
        self.listeners.write().remove(&kind);
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.read().get(&kind).map_or(0, Vec::len)
    }

    /// Deliver `event` to its subscribers.
    pub fn emit(&self, event: &PerformanceEvent) {
        let Some(kind) = event.kind() else {
            return;
        };
        // Snapshot so listeners may (un)subscribe while being called
        let targets: Vec<Listener> = match self.listeners.read().get(&kind) {
            Some(list) => list.iter().map(|(_, l)| l.clone()).collect(),
            None => return,
        };
        for listener in targets {
            listener(event);
        }
    }
}

impl std::fmt::Debug for PublicEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = self.listeners.read();
        let counts: HashMap<&str, usize> = listeners
            .iter()
            .map(|(k, v)| (k.as_str(), v.len()))
            .collect();
        f.debug_struct("PublicEvents")
            .field("listeners", &counts)
            .finish()
    }
}
