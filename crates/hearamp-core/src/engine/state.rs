//! Engine lifecycle state machine
//!
//! ```text
//!            start              open ok
//!  Stopped ─────────► Starting ─────────► Running ◄──────┐
//!     ▲                  │                 │   │         │ resume / retry ok
//!     │ restart          │ error     stop  │   │ suspend │
//!     │                  ▼                 ▼   ▼ / loss  │
//!   Failed ◄─────────────┴─────────── Stopping  Suspended┘
//!             fatal / retries exhausted    │        │
//!                                          ▼        │ stop
//!                                       Stopped ◄───┘ (via Stopping)
//! ```
//!
//! The current state lives in an `AtomicU8` so the audio callbacks can read
//! it without locking. They answer a non-running state with silence and
//! acknowledge through the `quiesced` flag.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::audio::AudioError;
use crate::profile::ProfileError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EngineState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Suspended = 3,
    Stopping = 4,
    Failed = 5,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => EngineState::Starting,
            2 => EngineState::Running,
            3 => EngineState::Suspended,
            4 => EngineState::Stopping,
            5 => EngineState::Failed,
            _ => EngineState::Stopped,
        }
    }

    /// Whether `self → to` is a legal transition
    pub fn can_transition_to(self, to: EngineState) -> bool {
        use EngineState::*;
        matches!(
            (self, to),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Starting, Stopped)
                | (Running, Stopping)
                | (Running, Suspended)
                | (Running, Failed)
                | (Suspended, Running)
                | (Suspended, Stopping)
                | (Suspended, Failed)
                | (Stopping, Stopped)
                | (Failed, Stopped)
        )
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EngineState::Stopped => "stopped",
            EngineState::Starting => "starting",
            EngineState::Running => "running",
            EngineState::Suspended => "suspended",
            EngineState::Stopping => "stopping",
            EngineState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Lifecycle and control errors
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: EngineState, to: EngineState },

    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error(transparent)]
    Profile(#[from] ProfileError),

    #[error("Failed to start parameter collector: {0}")]
    Collector(#[from] std::io::Error),
}

/// State shared between the control thread and the audio callbacks
#[derive(Debug)]
pub struct SharedState {
    state: AtomicU8,
    quiesced: AtomicBool,
}

impl Default for SharedState {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(EngineState::Stopped as u8),
            quiesced: AtomicBool::new(true),
        }
    }
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn load(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.load() == EngineState::Running
    }

    /// Move to `to` if the state machine allows it
    ///
    /// Returns the previous state.
    pub fn transition(&self, to: EngineState) -> Result<EngineState, EngineError> {
        let from = self.load();
        if !from.can_transition_to(to) {
            return Err(EngineError::InvalidTransition { from, to });
        }
        if to == EngineState::Running {
            self.quiesced.store(false, Ordering::Release);
        }
        self.state.store(to as u8, Ordering::Release);
        Ok(from)
    }

    /// Called by the audio callback once it has gone silent
    #[inline]
    pub fn acknowledge_quiesced(&self) {
        self.quiesced.store(true, Ordering::Release);
    }

    pub fn is_quiesced(&self) -> bool {
        self.quiesced.load(Ordering::Acquire)
    }

    /// Wait for the callback to acknowledge, up to `timeout`
    ///
    /// Returns false if the callback never ran (e.g. the device is gone).
    pub fn wait_quiesced(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_quiesced() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }
}
