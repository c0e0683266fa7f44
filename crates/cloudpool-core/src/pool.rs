//! Pool snapshots and derived views.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::machine::Machine;

/// An immutable snapshot of a pool's members.
///
/// Each successful fetch produces a new snapshot; snapshots are replaced,
/// never mutated. Machine ids are unique within a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachinePool {
    /// Members as reported by the backend.
    pub machines: Vec<Machine>,
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
}

impl MachinePool {
    /// Create a snapshot timestamped now.
    #[must_use]
    pub fn new(machines: Vec<Machine>) -> Self {
        Self::at(machines, Utc::now())
    }

    /// Create a snapshot with an explicit timestamp.
    ///
    /// Only the first machine listed under any id is kept.
    #[must_use]
    pub fn at(machines: Vec<Machine>, timestamp: DateTime<Utc>) -> Self {
        Self::from_listing(machines, timestamp).0
    }

    /// Create a snapshot from a backend listing, returning the ids of any
    /// repeated entries that were dropped.
    #[must_use]
    pub fn from_listing(machines: Vec<Machine>, timestamp: DateTime<Utc>) -> (Self, Vec<String>) {
        let mut seen = HashSet::with_capacity(machines.len());
        let mut duplicates = Vec::new();
        let mut unique = Vec::with_capacity(machines.len());
        for machine in machines {
            if seen.contains(&machine.id) {
                duplicates.push(machine.id);
            } else {
                seen.insert(machine.id.clone());
                unique.push(machine);
            }
        }
        let pool = Self {
            machines: unique,
            timestamp,
        };
        (pool, duplicates)
    }

    /// An empty snapshot timestamped now.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Look up a machine by id.
    #[must_use]
    pub fn get(&self, machine_id: &str) -> Option<&Machine> {
        self.machines.iter().find(|m| m.id == machine_id)
    }

    /// Returns true if a machine with the given id is in the snapshot.
    #[must_use]
    pub fn contains(&self, machine_id: &str) -> bool {
        self.get(machine_id).is_some()
    }

    /// Machines that count toward the desired size.
    pub fn active_machines(&self) -> impl Iterator<Item = &Machine> {
        self.machines.iter().filter(|m| m.is_active_member())
    }

    /// Number of active members.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active_machines().count()
    }

    /// Number of active members still in `REQUESTED` or `PENDING`.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.active_machines()
            .filter(|m| m.machine_state.is_pending())
            .count()
    }

    /// Summarize the snapshot against a desired size.
    #[must_use]
    pub fn size_summary(&self, desired_size: u32) -> PoolSizeSummary {
        PoolSizeSummary {
            timestamp: self.timestamp,
            desired_size,
            allocated: self.active_count(),
            pending_count: self.pending_count(),
        }
    }
}

/// Size view derived from a snapshot and the desired size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSizeSummary {
    /// Timestamp of the snapshot this summary was computed from.
    pub timestamp: DateTime<Utc>,
    /// Target number of active members.
    pub desired_size: u32,
    /// Current number of active members.
    pub allocated: usize,
    /// Active members not yet running.
    pub pending_count: usize,
}

/// Lifecycle flags of a pool engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CloudPoolStatus {
    /// Periodic fetching and updating is running.
    pub started: bool,
    /// A configuration has been applied.
    pub configured: bool,
}
