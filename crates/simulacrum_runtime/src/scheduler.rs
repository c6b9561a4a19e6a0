//! Refresh Scheduler
//!
//! Mutating commands only mark the model dirty. Two periodic ticks, driven
//! by the owning service's timers, do the expensive work:
//!
//! - the push tick recomputes the derived tables exposed as channels
//! - the broadcast tick recomputes every snapshot kind and publishes them
//!
//! Each side has its own flag, so any number of marks between two ticks
//! costs one recompute per side.

use std::fmt;

use simulacrum_types::Snapshot;

use crate::protocol::ProtocolError;

// ─────────────────────────────────────────────────────────────────────────────
// Dirty Flags
// ─────────────────────────────────────────────────────────────────────────────

/// Independent staleness flags for push tables and broadcasts
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DirtyFlags {
    needs_push: bool,
    needs_broadcast: bool,
    marks: u64,
}

impl DirtyFlags {
    /// Set both flags
    pub fn mark_dirty(&mut self) {
        self.needs_push = true;
        self.needs_broadcast = true;
        self.marks += 1;
    }

    /// Set only the broadcast flag
    pub fn mark_broadcast(&mut self) {
        self.needs_broadcast = true;
    }

    pub fn needs_push(&self) -> bool {
        self.needs_push
    }

    pub fn needs_broadcast(&self) -> bool {
        self.needs_broadcast
    }

    /// Total marks since creation
    pub fn marks(&self) -> u64 {
        self.marks
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Refresh Target
// ─────────────────────────────────────────────────────────────────────────────

/// State the scheduler recomputes from
pub trait RefreshTarget {
    type Error: fmt::Display;

    /// Recompute the derived push tables and republish them
    fn refresh_push(&mut self) -> Result<(), Self::Error>;

    /// Snapshot kinds produced on every broadcast tick, in publish order
    fn snapshot_kinds(&self) -> Vec<String>;

    /// Compute one snapshot kind
    fn compute_snapshot(&mut self, kind: &str) -> Result<Snapshot, Self::Error>;
}

/// Outcome of one broadcast tick
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub published: Vec<String>,
    pub failed: Vec<String>,
}

impl BroadcastReport {
    pub fn is_empty(&self) -> bool {
        self.published.is_empty() && self.failed.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scheduler
// ─────────────────────────────────────────────────────────────────────────────

/// Dirty-flag gate between mutating commands and periodic recomputes
#[derive(Debug, Default)]
pub struct RefreshScheduler {
    flags: DirtyFlags,
    push_cycles: u64,
    broadcast_cycles: u64,
}

impl RefreshScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a recompute of both push tables and broadcasts
    pub fn mark_dirty(&mut self) {
        self.flags.mark_dirty();
    }

    /// Request a broadcast without touching the push tables
    pub fn request_broadcast(&mut self) {
        self.flags.mark_broadcast();
    }

    pub fn flags(&self) -> &DirtyFlags {
        &self.flags
    }

    /// Number of push recomputes performed
    pub fn push_cycles(&self) -> u64 {
        self.push_cycles
    }

    /// Number of broadcast cycles performed
    pub fn broadcast_cycles(&self) -> u64 {
        self.broadcast_cycles
    }

    /// Run one push tick. Returns true if a recompute happened.
    pub fn push_tick<T: RefreshTarget>(&mut self, target: &mut T) -> bool {
        if !self.flags.needs_push {
            return false;
        }

        if let Err(e) = target.refresh_push() {
            tracing::warn!(error = %e, "Push table refresh failed");
        }
        self.flags.needs_push = false;
        self.push_cycles += 1;
        true
    }

    /// Run one broadcast tick
    ///
    /// Every snapshot kind is attempted even if an earlier one fails; the
    /// flag is cleared once all have been attempted.
    pub fn broadcast_tick<T, P>(&mut self, target: &mut T, mut publish: P) -> BroadcastReport
    where
        T: RefreshTarget,
        P: FnMut(&Snapshot) -> Result<(), ProtocolError>,
    {
        let mut report = BroadcastReport::default();
        if !self.flags.needs_broadcast {
            return report;
        }

        for kind in target.snapshot_kinds() {
            let outcome = target
                .compute_snapshot(&kind)
                .map_err(|e| e.to_string())
                .and_then(|snapshot| publish(&snapshot).map_err(|e| e.to_string()));

            match outcome {
                Ok(()) => report.published.push(kind),
                Err(error) => {
                    tracing::warn!(kind = %kind, error = %error, "Snapshot recompute failed");
                    report.failed.push(kind);
                }
            }
        }

        self.flags.needs_broadcast = false;
        self.broadcast_cycles += 1;
        report
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
