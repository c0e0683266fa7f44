//! Machine types.
//!
//! A [`Machine`] is one unit of a pool as observed by a backend driver. Whether
//! it counts toward the pool's desired size is decided by its
//! [`MachineState`] together with its [`MembershipStatus`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Lifecycle states of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MachineState {
    /// A launch request was accepted but no concrete resource is allocated yet.
    Requested,
    /// The resource is allocated and booting.
    Pending,
    /// The machine is up.
    Running,
    /// Shutdown in progress.
    Terminating,
    /// The machine is gone.
    Terminated,
}

impl MachineState {
    /// All states in lifecycle order.
    pub const ALL: [Self; 5] = [
        Self::Requested,
        Self::Pending,
        Self::Running,
        Self::Terminating,
        Self::Terminated,
    ];

    /// Returns true for the non-terminal states a backend has allocated
    /// (or promised to allocate) capacity for.
    #[must_use]
    pub const fn is_allocated(self) -> bool {
        matches!(self, Self::Requested | Self::Pending | Self::Running)
    }

    /// Returns true for states that are still on their way to `Running`.
    #[must_use]
    pub const fn is_pending(self) -> bool {
        matches!(self, Self::Requested | Self::Pending)
    }

    /// The wire name of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "REQUESTED",
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Terminating => "TERMINATING",
            Self::Terminated => "TERMINATED",
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MachineState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| CoreError::UnknownMachineState(s.to_string()))
    }
}

/// Operator-reported health of the service running on a machine.
///
/// Independent of the machine's lifecycle state. Every machine reports
/// `Unknown` until a state has been set explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceState {
    /// The service is starting up.
    Booting,
    /// The service is healthy and serving.
    InService,
    /// The service is unhealthy or drained.
    OutOfService,
    /// Nothing has been reported.
    #[default]
    Unknown,
}

impl ServiceState {
    /// The wire name of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Booting => "BOOTING",
            Self::InService => "IN_SERVICE",
            Self::OutOfService => "OUT_OF_SERVICE",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            Self::Booting,
            Self::InService,
            Self::OutOfService,
            Self::Unknown,
        ]
        .into_iter()
        .find(|state| state.as_str().eq_ignore_ascii_case(s))
        .ok_or_else(|| CoreError::UnknownServiceState(s.to_string()))
    }
}

/// Membership flags of a pool machine.
///
/// `active` decides whether the machine counts toward the desired size;
/// `evictable` decides whether scale-down may pick it as a victim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipStatus {
    /// Counts toward the desired size.
    pub active: bool,
    /// May be terminated on scale-down.
    pub evictable: bool,
}

impl MembershipStatus {
    /// Create a membership status from its two flags.
    #[must_use]
    pub const fn new(active: bool, evictable: bool) -> Self {
        Self { active, evictable }
    }

    /// Active and evictable: what every machine has unless tagged otherwise.
    #[must_use]
    pub const fn default_status() -> Self {
        Self::new(true, true)
    }

    /// Active but protected from scale-down.
    #[must_use]
    pub const fn blessed() -> Self {
        Self::new(true, false)
    }

    /// Inactive and evictable; the pool replaces it.
    #[must_use]
    pub const fn disposable() -> Self {
        Self::new(false, true)
    }

    /// Inactive and protected, e.g. kept around for troubleshooting.
    #[must_use]
    pub const fn awaiting_service() -> Self {
        Self::new(false, false)
    }
}

impl Default for MembershipStatus {
    fn default() -> Self {
        Self::default_status()
    }
}

/// A machine that belongs to a pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    /// Backend-assigned identifier, unique within a pool.
    pub id: String,
    /// Lifecycle state.
    pub machine_state: MachineState,
    /// Membership flags.
    #[serde(default)]
    pub membership_status: MembershipStatus,
    /// Operator-reported service health.
    #[serde(default)]
    pub service_state: ServiceState,
    /// Cloud provider name, e.g. `AWS-EC2`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_provider: Option<String>,
    /// Region or zone the machine lives in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Provider-specific size or flavor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_size: Option<String>,
    /// When the machine was requested.
    #[serde(default)]
    pub request_time: Option<DateTime<Utc>>,
    /// When the machine was launched.
    #[serde(default)]
    pub launch_time: Option<DateTime<Utc>>,
    /// Public addresses.
    #[serde(default)]
    pub public_ips: Vec<String>,
    /// Private addresses.
    #[serde(default)]
    pub private_ips: Vec<String>,
    /// Opaque backend document, passed through unmodified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Machine {
    /// Create a machine with default membership, unknown service state and
    /// no descriptive attributes.
    #[must_use]
    pub fn new(id: impl Into<String>, machine_state: MachineState) -> Self {
        Self {
            id: id.into(),
            machine_state,
            membership_status: MembershipStatus::default(),
            service_state: ServiceState::default(),
            cloud_provider: None,
            region: None,
            machine_size: None,
            request_time: None,
            launch_time: None,
            public_ips: Vec::new(),
            private_ips: Vec::new(),
            metadata: None,
        }
    }

    /// Set the launch time.
    #[must_use]
    pub fn with_launch_time(mut self, launch_time: DateTime<Utc>) -> Self {
        self.launch_time = Some(launch_time);
        self
    }

    /// Set the membership status.
    #[must_use]
    pub fn with_membership_status(mut self, status: MembershipStatus) -> Self {
        self.membership_status = status;
        self
    }

    /// Set the service state.
    #[must_use]
    pub fn with_service_state(mut self, state: ServiceState) -> Self {
        self.service_state = state;
        self
    }

    /// Set provider, region and size in one go.
    #[must_use]
    pub fn with_placement(
        mut self,
        cloud_provider: impl Into<String>,
        region: impl Into<String>,
        machine_size: impl Into<String>,
    ) -> Self {
        self.cloud_provider = Some(cloud_provider.into());
        self.region = Some(region.into());
        self.machine_size = Some(machine_size.into());
        self
    }

    /// Returns true if the backend holds capacity for this machine.
    #[must_use]
    pub const fn is_allocated(&self) -> bool {
        self.machine_state.is_allocated()
    }

    /// Returns true if the machine counts toward the desired size.
    ///
    /// Service state plays no part in this.
    #[must_use]
    pub const fn is_active_member(&self) -> bool {
        self.is_allocated() && self.membership_status.active
    }

    /// Returns true if scale-down may select this machine.
    #[must_use]
    pub const fn is_evictable_member(&self) -> bool {
        self.is_active_member() && self.membership_status.evictable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_states() {
        assert!(MachineState::Requested.is_allocated());
        assert!(MachineState::Pending.is_allocated());
        assert!(MachineState::Running.is_allocated());
        assert!(!MachineState::Terminating.is_allocated());
        assert!(!MachineState::Terminated.is_allocated());
    }

    #[test]
    fn machine_state_parse() {
        assert_eq!(
            "running".parse::<MachineState>().unwrap(),
            MachineState::Running
        );
        assert_eq!(
            "TERMINATED".parse::<MachineState>().unwrap(),
            MachineState::Terminated
        );
        assert!(matches!(
            "exploded".parse::<MachineState>(),
            Err(CoreError::UnknownMachineState(_))
        ));
    }

    #[test]
    fn defaults_are_unknown_and_active_evictable() {
        let machine = Machine::new("i-1", MachineState::Running);
        assert_eq!(machine.service_state, ServiceState::Unknown);
        assert_eq!(machine.membership_status, MembershipStatus::new(true, true));
        assert!(machine.is_active_member());
        assert!(machine.is_evictable_member());
    }

    #[test]
    fn active_member_ignores_service_state() {
        for service_state in [
            ServiceState::Booting,
            ServiceState::InService,
            ServiceState::OutOfService,
            ServiceState::Unknown,
        ] {
            let machine =
                Machine::new("i-1", MachineState::Pending).with_service_state(service_state);
            assert!(machine.is_active_member());
        }
    }

    #[test]
    fn inactive_membership_is_not_counted() {
        let machine = Machine::new("i-1", MachineState::Running)
            .with_membership_status(MembershipStatus::disposable());
        assert!(machine.is_allocated());
        assert!(!machine.is_active_member());
        assert!(!machine.is_evictable_member());
    }

    #[test]
    fn blessed_is_active_but_not_evictable() {
        let machine = Machine::new("i-1", MachineState::Running)
            .with_membership_status(MembershipStatus::blessed());
        assert!(machine.is_active_member());
        assert!(!machine.is_evictable_member());
    }

    #[test]
    fn machine_json_defaults() {
        let machine: Machine =
            serde_json::from_str(r#"{"id": "i-9", "machineState": "PENDING"}"#).unwrap();
        assert_eq!(machine.id, "i-9");
        assert_eq!(machine.machine_state, MachineState::Pending);
        assert_eq!(machine.membership_status, MembershipStatus::default_status());
        assert_eq!(machine.service_state, ServiceState::Unknown);
        assert!(machine.launch_time.is_none());
    }

    #[test]
    fn machine_json_field_names() {
        let machine = Machine::new("i-1", MachineState::Running)
            .with_service_state(ServiceState::OutOfService);
        let json = serde_json::to_value(&machine).unwrap();
        assert_eq!(json["machineState"], "RUNNING");
        assert_eq!(json["serviceState"], "OUT_OF_SERVICE");
        assert_eq!(json["membershipStatus"]["evictable"], true);
    }
}
