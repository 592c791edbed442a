use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::types::{ToolError, ToolErrorCode, ToolOutcome};
use crate::viewer::{Viewer, ViewerFactory, WindowStatus};

/// FIFO mutual exclusion around every resource-touching dispatch.
#[derive(Default)]
pub struct SessionLock {
    inner: tokio::sync::Mutex<()>,
}

impl SessionLock {
    pub async fn acquire(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.inner.lock().await
    }
}

type SharedViewer = Arc<Mutex<Box<dyn Viewer>>>;

/// Reference to the live viewer. Usable only on the thread that created it.
#[derive(Clone)]
pub struct ResourceHandle {
    viewer: SharedViewer,
    owner: ThreadId,
    generation: u64,
}

impl ResourceHandle {
    fn new(viewer: Box<dyn Viewer>, generation: u64) -> Self {
        Self {
            viewer: Arc::new(Mutex::new(viewer)),
            owner: thread::current().id(),
            generation,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// A panic inside an earlier `op` poisons the lock; the viewer itself is
    /// still usable, so the poison is cleared rather than surfaced.
    pub fn with<T>(&self, op: impl FnOnce(&mut dyn Viewer) -> T) -> ToolOutcome<T> {
        if thread::current().id() != self.owner {
            return Err(ToolError::new(
                ToolErrorCode::WrongContext,
                "viewer accessed outside its owning thread",
            ));
        }
        let mut guard = self.viewer.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(op(&mut **guard))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Uninitialized,
    Live,
    Closed,
    Destroyed,
}

impl SessionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Live => "live",
            Self::Closed => "closed",
            Self::Destroyed => "destroyed",
        }
    }

    /// Every event is accepted from every phase; the resulting phase only
    /// depends on the event.
    pub fn next(self, event: SessionEvent) -> Self {
        match event {
            SessionEvent::Created => Self::Live,
            SessionEvent::Closed => Self::Closed,
            SessionEvent::WindowDestroyed => Self::Destroyed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Created,
    Closed,
    WindowDestroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpTick {
    Idle,
    Alive,
    Destroyed,
}

struct SessionState {
    phase: SessionPhase,
    handle: Option<ResourceHandle>,
    generation: u64,
}

/// Owns the process-wide viewer singleton and its lifecycle. All methods
/// that touch the viewer are meant to run on the designated thread.
pub struct SessionContext {
    factory: Arc<dyn ViewerFactory>,
    default_title: String,
    state: Mutex<SessionState>,
}

impl SessionContext {
    pub fn new(factory: Arc<dyn ViewerFactory>, default_title: impl Into<String>) -> Self {
        Self {
            factory,
            default_title: default_title.into(),
            state: Mutex::new(SessionState {
                phase: SessionPhase::Uninitialized,
                handle: None,
                generation: 0,
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(state: &mut SessionState, event: SessionEvent) {
        let next = state.phase.next(event);
        debug!(
            "session transition {} -> {} on {event:?} (generation {})",
            state.phase.as_str(),
            next.as_str(),
            state.generation
        );
        state.phase = next;
    }

    pub fn phase(&self) -> SessionPhase {
        self.lock_state().phase
    }

    pub fn current(&self) -> Option<ResourceHandle> {
        self.lock_state().handle.clone()
    }

    /// Returns the live handle, creating the viewer when none exists or the
    /// previous window was closed behind our back. The flag reports creation.
    pub fn ensure(&self, title: Option<&str>) -> ToolOutcome<(ResourceHandle, bool)> {
        let mut state = self.lock_state();
        if let Some(handle) = state.handle.clone() {
            match handle.with(|viewer| viewer.process_events())? {
                WindowStatus::Open => return Ok((handle, false)),
                WindowStatus::Destroyed => {
                    info!("viewer window was closed externally; recreating");
                    state.handle = None;
                    Self::transition(&mut state, SessionEvent::WindowDestroyed);
                }
            }
        }

        let title = title.unwrap_or(&self.default_title);
        let viewer = self.factory.create(title).map_err(|err| {
            ToolError::new(
                ToolErrorCode::Unavailable,
                format!("failed to create viewer: {err:#}"),
            )
        })?;
        state.generation += 1;
        let handle = ResourceHandle::new(viewer, state.generation);
        state.handle = Some(handle.clone());
        Self::transition(&mut state, SessionEvent::Created);
        info!("viewer created (generation {})", state.generation);
        Ok((handle, true))
    }

    /// Explicit close. Returns false when there was nothing to close.
    pub fn close(&self) -> ToolOutcome<bool> {
        let mut state = self.lock_state();
        let Some(handle) = state.handle.take() else {
            return Ok(false);
        };
        if let Err(err) = handle.with(|viewer| viewer.close()) {
            warn!("closing viewer failed: {err}");
        }
        Self::transition(&mut state, SessionEvent::Closed);
        Ok(true)
    }

    /// One event-processing pass; clears the singleton when the window is gone.
    pub fn pump(&self) -> ToolOutcome<PumpTick> {
        let mut state = self.lock_state();
        let Some(handle) = state.handle.clone() else {
            return Ok(PumpTick::Idle);
        };
        match handle.with(|viewer| viewer.process_events())? {
            WindowStatus::Open => Ok(PumpTick::Alive),
            WindowStatus::Destroyed => {
                info!("viewer window destroyed; clearing session");
                state.handle = None;
                Self::transition(&mut state, SessionEvent::WindowDestroyed);
                Ok(PumpTick::Destroyed)
            }
        }
    }

    pub fn describe(&self) -> Value {
        let state = self.lock_state();
        json!({
            "phase": state.phase.as_str(),
            "generation": state.generation,
            "has_viewer": state.handle.is_some(),
        })
    }
}
