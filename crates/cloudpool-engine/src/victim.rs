//! Scale-down victim selection.
//!
//! Picks which machines to terminate when the pool has more active members
//! than desired. Only active, evictable members are eligible. Selection is a
//! pure function of its inputs: the same machines, policy, count and clock
//! always give the same ordered result.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use cloudpool_core::Machine;
use serde::{Deserialize, Serialize};

const INSTANCE_HOUR_MILLIS: i64 = 3_600_000;

/// Order in which eligible machines are removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VictimSelectionPolicy {
    /// Earliest launch time first.
    Oldest,
    /// Latest launch time first.
    #[default]
    Newest,
    /// Machines closest to completing a billed instance hour first.
    ClosestToInstanceHour,
}

/// Result of a victim selection.
#[derive(Debug, Clone, PartialEq)]
pub struct VictimSelection {
    /// Machines to terminate, in selection order.
    pub victims: Vec<Machine>,
    /// How many more victims were asked for than were eligible.
    pub shortfall: usize,
}

/// Select up to `count` machines to remove from `candidates`.
///
/// A machine without a launch time is never preferred over one with a known
/// age, under any policy. Ties are broken by id, ascending.
#[must_use]
pub fn select_victims(
    candidates: &[Machine],
    count: usize,
    policy: VictimSelectionPolicy,
    now: DateTime<Utc>,
) -> VictimSelection {
    let mut eligible: Vec<&Machine> = candidates
        .iter()
        .filter(|m| m.is_evictable_member())
        .collect();

    eligible.sort_by(|a, b| compare(a, b, policy, now).then_with(|| a.id.cmp(&b.id)));

    let victims: Vec<Machine> = eligible.into_iter().take(count).cloned().collect();
    let shortfall = count - victims.len();

    VictimSelection { victims, shortfall }
}

fn compare(a: &Machine, b: &Machine, policy: VictimSelectionPolicy, now: DateTime<Utc>) -> Ordering {
    match policy {
        VictimSelectionPolicy::Oldest => known_first(a.launch_time, b.launch_time, |x, y| x.cmp(&y)),
        VictimSelectionPolicy::Newest => known_first(a.launch_time, b.launch_time, |x, y| y.cmp(&x)),
        VictimSelectionPolicy::ClosestToInstanceHour => known_first(
            millis_into_hour(a, now),
            millis_into_hour(b, now),
            |x, y| y.cmp(&x),
        ),
    }
}

/// Orders known values with `cmp`, placing unknown values last.
fn known_first<T>(a: Option<T>, b: Option<T>, cmp: impl Fn(T, T) -> Ordering) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => cmp(x, y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Time elapsed in the machine's current instance hour. Launch times in the
/// future count as just launched.
fn millis_into_hour(machine: &Machine, now: DateTime<Utc>) -> Option<i64> {
    machine.launch_time.map(|launched| {
        let elapsed = (now - launched).num_milliseconds().max(0);
        elapsed % INSTANCE_HOUR_MILLIS
    })
}
