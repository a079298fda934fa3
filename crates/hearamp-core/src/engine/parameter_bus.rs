//! Lock-free parameter hand-off from the control thread to the audio thread
//!
//! The control thread builds a complete [`ParameterSnapshot`], wraps it in a
//! `basedrop::Shared` and swaps it into a `SharedCell`. The audio thread
//! checks a generation counter once per frame and, when it moved, clones the
//! current `Shared` (an atomic increment). It therefore always sees one whole
//! snapshot, never a mix of two.
//!
//! The reader's previous snapshot is released by a refcount decrement; the
//! memory itself is reclaimed on the `param-gc` thread (see [`super::gc`]).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use basedrop::{Handle, Shared, SharedCell};

use crate::profile::{AudiogramProfile, ProfileError, ProfileSnapshot};
use crate::types::SAMPLE_RATE;

/// Allowed master gain range in dB
pub const MASTER_GAIN_RANGE_DB: (f32, f32) = (-60.0, 20.0);

/// Everything the processor needs, copied into fixed storage
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterSnapshot {
    /// Monotonic tag stamped by the publisher (0 = initial)
    pub generation: u64,
    pub profile: ProfileSnapshot,
    pub master_gain_db: f32,
    pub muted: bool,
    pub feedback_enabled: bool,
}

impl ParameterSnapshot {
    /// Snapshot of an already validated profile
    pub fn new(profile: &AudiogramProfile, master_gain_db: f32, muted: bool, feedback_enabled: bool) -> Self {
        Self {
            generation: 0,
            profile: ProfileSnapshot::from_profile(profile),
            master_gain_db,
            muted,
            feedback_enabled,
        }
    }
}

struct BusShared {
    cell: SharedCell<ParameterSnapshot>,
    generation: AtomicU64,
}

/// Create a bus seeded with `initial`
pub fn parameter_bus(handle: &Handle, initial: ParameterSnapshot) -> (ParameterPublisher, ParameterReader) {
    let shared = Arc::new(BusShared {
        cell: SharedCell::new(Shared::new(handle, initial)),
        generation: AtomicU64::new(initial.generation),
    });
    let publisher = ParameterPublisher {
        shared,
        handle: handle.clone(),
        current: initial,
        sample_rate: SAMPLE_RATE,
        locked_band_count: None,
    };
    let reader = publisher.reader();
    (publisher, reader)
}

/// Control-thread side
pub struct ParameterPublisher {
    shared: Arc<BusShared>,
    handle: Handle,
    current: ParameterSnapshot,
    sample_rate: u32,
    locked_band_count: Option<usize>,
}

impl ParameterPublisher {
    /// A new reader starting at the current snapshot
    pub fn reader(&self) -> ParameterReader {
        let current = self.shared.cell.get();
        ParameterReader {
            shared: Arc::clone(&self.shared),
            seen: current.generation,
            current,
        }
    }

    /// Last published snapshot
    pub fn current(&self) -> &ParameterSnapshot {
        &self.current
    }

    /// Rate crossovers are validated against
    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate;
    }

    /// Pin the band count while a stream is open (None = unpinned)
    pub fn lock_band_count(&mut self, band_count: Option<usize>) {
        self.locked_band_count = band_count;
    }

    /// Validate and publish a new fitting
    ///
    /// On error nothing is published and the previous snapshot stays live.
    pub fn publish_profile(&mut self, profile: &AudiogramProfile) -> Result<u64, ProfileError> {
        profile.validate_for_rate(self.sample_rate)?;
        if let Some(expected) = self.locked_band_count {
            if profile.band_count() != expected {
                return Err(ProfileError::BandCountMismatch {
                    expected,
                    actual: profile.band_count(),
                });
            }
        }
        let mut next = self.current;
        next.profile = ProfileSnapshot::from_profile(profile);
        Ok(self.publish(next))
    }

    pub fn set_master_gain_db(&mut self, gain_db: f32) -> Result<u64, ProfileError> {
        let (min, max) = MASTER_GAIN_RANGE_DB;
        if !gain_db.is_finite() || !(min..=max).contains(&gain_db) {
            return Err(ProfileError::ProfileValue {
                field: "master_gain_db",
                value: gain_db,
            });
        }
        let mut next = self.current;
        next.master_gain_db = gain_db;
        Ok(self.publish(next))
    }

    pub fn set_muted(&mut self, muted: bool) -> u64 {
        let mut next = self.current;
        next.muted = muted;
        self.publish(next)
    }

    pub fn set_feedback_enabled(&mut self, enabled: bool) -> u64 {
        let mut next = self.current;
        next.feedback_enabled = enabled;
        self.publish(next)
    }

    fn publish(&mut self, mut next: ParameterSnapshot) -> u64 {
        next.generation = self.current.generation + 1;
        self.current = next;
        // Cell first, then the counter: a reader that sees the new
        // generation is guaranteed to find this snapshot (or a newer one).
        self.shared.cell.set(Shared::new(&self.handle, next));
        self.shared.generation.store(next.generation, Ordering::Release);
        next.generation
    }
}

/// Audio-thread side
pub struct ParameterReader {
    shared: Arc<BusShared>,
    current: Shared<ParameterSnapshot>,
    seen: u64,
}

impl ParameterReader {
    /// The newer snapshot if one was published since the last call
    ///
    /// Never blocks or allocates.
    #[inline]
    pub fn consume_latest(&mut self) -> Option<&ParameterSnapshot> {
        if self.shared.generation.load(Ordering::Acquire) == self.seen {
            return None;
        }
        self.current = self.shared.cell.get();
        self.seen = self.current.generation;
        Some(&self.current)
    }

    /// Snapshot currently in use
    pub fn current(&self) -> &ParameterSnapshot {
        &self.current
    }
}
