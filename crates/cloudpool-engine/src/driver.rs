//! Driver capability interface.
//!
//! A [`CloudPoolDriver`] adapts one cloud backend to the uniform machine
//! model. The engine never branches on backend type; everything it needs
//! from a backend goes through this trait.
//!
//! Drivers must tolerate concurrent invocation of every operation. The
//! engine runs fetches, reconciliation and API-delegated calls against the
//! same driver at the same time.

use std::collections::BTreeMap;

use async_trait::async_trait;
use cloudpool_core::{Machine, MembershipStatus, ServiceState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A result type using `DriverError`.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Errors reported by a driver for single operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// An operation other than `configure` was called first.
    #[error("driver has not been configured")]
    NotConfigured,

    /// The backend rejected the configuration documents.
    #[error("invalid driver configuration: {0}")]
    InvalidConfig(String),

    /// The machine is not a recognized pool member.
    #[error("machine not found: {0}")]
    NotFound(String),

    /// The backend API failed.
    #[error("cloud backend error: {0}")]
    Backend(String),
}

/// A start batch that stopped partway.
///
/// `started` holds every machine that was launched before `cause` occurred,
/// so the caller's size accounting stays correct.
#[derive(Debug, Clone, Error)]
#[error("started {} of {requested} requested machine(s): {cause}", .started.len())]
pub struct StartMachinesError {
    /// Number of machines asked for.
    pub requested: u32,
    /// Machines that did launch.
    pub started: Vec<Machine>,
    /// What stopped the batch.
    pub cause: DriverError,
}

/// Per-machine outcome of a terminate batch with at least one failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to terminate {} machine(s): {}", .errors.len(), format_failures(.errors))]
pub struct TerminateMachinesError {
    /// Machines that were terminated.
    pub terminated: Vec<String>,
    /// Machines that could not be terminated, with the reason.
    pub errors: BTreeMap<String, DriverError>,
}

fn format_failures(errors: &BTreeMap<String, DriverError>) -> String {
    errors
        .iter()
        .map(|(id, err)| format!("{id}: {err}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Configuration handed to a driver.
///
/// The two documents are opaque to the engine; only the driver knows their
/// schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverConfig {
    /// Logical pool identifier.
    pub pool_name: String,
    /// Credentials, endpoints and region of the backend API.
    pub cloud_api_settings: Value,
    /// Describes how new machines are provisioned.
    pub provisioning_template: Value,
}

/// The operations the engine needs from a cloud backend.
#[async_trait]
pub trait CloudPoolDriver: Send + Sync {
    /// Validate and apply a configuration.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::InvalidConfig` on structural problems with
    /// either document.
    async fn configure(&self, config: &DriverConfig) -> DriverResult<()>;

    /// List the machines currently in the pool, in no particular order.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::Backend` if the backend cannot be queried.
    async fn list_machines(&self) -> DriverResult<Vec<Machine>>;

    /// Launch `count` new machines.
    ///
    /// # Errors
    ///
    /// Returns a `StartMachinesError` naming every machine that did start if
    /// the batch fails partway.
    async fn start_machines(&self, count: u32) -> Result<Vec<Machine>, StartMachinesError>;

    /// Terminate the given machines.
    ///
    /// An unknown id fails on its own without affecting the others.
    ///
    /// # Errors
    ///
    /// Returns a `TerminateMachinesError` with per-machine outcomes if any
    /// machine could not be terminated.
    async fn terminate_machines(&self, machine_ids: &[String])
        -> Result<(), TerminateMachinesError>;

    /// Bring an existing machine into the pool.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::NotFound` if the machine does not exist.
    async fn attach_machine(&self, machine_id: &str) -> DriverResult<()>;

    /// Remove a machine from the pool without terminating it.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::NotFound` if the machine is not a pool member.
    async fn detach_machine(&self, machine_id: &str) -> DriverResult<()>;

    /// Tag a machine with a service state.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::NotFound` if the machine is not a pool member.
    async fn set_service_state(&self, machine_id: &str, state: ServiceState)
        -> DriverResult<()>;

    /// Tag a machine with a membership status.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::NotFound` if the machine is not a pool member.
    async fn set_membership_status(
        &self,
        machine_id: &str,
        status: MembershipStatus,
    ) -> DriverResult<()>;

    /// The pool name fixed at configure time.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::NotConfigured` before the first `configure`.
    fn pool_name(&self) -> DriverResult<String>;

    /// Identifies the kind of backend, such as `AWS-EC2` or `OpenStack`.
    ///
    /// Available before `configure`.
    fn pool_identifier(&self) -> &str;
}

/// An in-memory driver for testing without a cloud backend.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use chrono::Utc;
    use cloudpool_core::MachineState;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;

    /// A mock driver that keeps its machines in memory.
    ///
    /// Started machines get ids `mock-1`, `mock-2`, ... and begin `PENDING`.
    /// Terminated machines stay listed in state `TERMINATED`.
    #[derive(Default)]
    pub struct MockDriver {
        inner: Mutex<MockState>,
    }

    #[derive(Default)]
    struct MockState {
        config: Option<DriverConfig>,
        machines: Vec<Machine>,
        detached: HashMap<String, Machine>,
        next_id: u64,
        failing_lists: u32,
        list_delay: Option<Duration>,
        start_capacity: Option<u32>,
        list_calls: usize,
        start_calls: usize,
        terminate_calls: usize,
    }

    impl MockState {
        fn ensure_configured(&self) -> DriverResult<&DriverConfig> {
            self.config.as_ref().ok_or(DriverError::NotConfigured)
        }

        fn member_mut(&mut self, machine_id: &str) -> DriverResult<&mut Machine> {
            self.machines
                .iter_mut()
                .find(|m| m.id == machine_id)
                .ok_or_else(|| DriverError::NotFound(machine_id.to_string()))
        }
    }

    impl MockDriver {
        /// Create a new mock driver with no machines.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Create a mock driver that already holds the given machines.
        #[must_use]
        pub fn with_machines(machines: Vec<Machine>) -> Self {
            let driver = Self::new();
            driver.inner.lock().machines = machines;
            driver
        }

        /// Add a pool member.
        pub fn add_machine(&self, machine: Machine) {
            self.inner.lock().machines.push(machine);
        }

        /// Register a machine that exists in the backend but outside the pool.
        pub fn add_detached_machine(&self, machine: Machine) {
            self.inner
                .lock()
                .detached
                .insert(machine.id.clone(), machine);
        }

        /// Current pool members, including terminated ones.
        #[must_use]
        pub fn machines(&self) -> Vec<Machine> {
            self.inner.lock().machines.clone()
        }

        /// Look up a pool member.
        #[must_use]
        pub fn machine(&self, machine_id: &str) -> Option<Machine> {
            self.inner
                .lock()
                .machines
                .iter()
                .find(|m| m.id == machine_id)
                .cloned()
        }

        /// Number of members counting toward the desired size.
        #[must_use]
        pub fn active_count(&self) -> usize {
            self.inner
                .lock()
                .machines
                .iter()
                .filter(|m| m.is_active_member())
                .count()
        }

        /// Make the next `count` calls to `list_machines` fail.
        pub fn fail_next_lists(&self, count: u32) {
            self.inner.lock().failing_lists = count;
        }

        /// Make every `list_machines` call take `delay` before returning.
        ///
        /// The listing reflects the machines at the time of the call.
        pub fn delay_lists(&self, delay: Option<Duration>) {
            self.inner.lock().list_delay = delay;
        }

        /// Let only `capacity` more machines start; later starts fail.
        pub fn limit_starts(&self, capacity: Option<u32>) {
            self.inner.lock().start_capacity = capacity;
        }

        /// The last configuration applied.
        #[must_use]
        pub fn config(&self) -> Option<DriverConfig> {
            self.inner.lock().config.clone()
        }

        /// Number of `list_machines` calls so far.
        #[must_use]
        pub fn list_calls(&self) -> usize {
            self.inner.lock().list_calls
        }

        /// Number of `start_machines` calls so far.
        #[must_use]
        pub fn start_calls(&self) -> usize {
            self.inner.lock().start_calls
        }

        /// Number of `terminate_machines` calls so far.
        #[must_use]
        pub fn terminate_calls(&self) -> usize {
            self.inner.lock().terminate_calls
        }
    }

    #[async_trait]
    impl CloudPoolDriver for MockDriver {
        async fn configure(&self, config: &DriverConfig) -> DriverResult<()> {
            let region = config
                .cloud_api_settings
                .get("region")
                .and_then(Value::as_str);
            if region.is_none() {
                return Err(DriverError::InvalidConfig(
                    "cloudApiSettings: missing region".to_string(),
                ));
            }
            if !config.provisioning_template.is_object() {
                return Err(DriverError::InvalidConfig(
                    "provisioningTemplate: expected an object".to_string(),
                ));
            }
            self.inner.lock().config = Some(config.clone());
            Ok(())
        }

        async fn list_machines(&self) -> DriverResult<Vec<Machine>> {
            let (machines, delay) = {
                let mut state = self.inner.lock();
                state.ensure_configured()?;
                state.list_calls += 1;
                if state.failing_lists > 0 {
                    state.failing_lists -= 1;
                    return Err(DriverError::Backend("listing timed out".to_string()));
                }
                (state.machines.clone(), state.list_delay)
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(machines)
        }

        async fn start_machines(&self, count: u32) -> Result<Vec<Machine>, StartMachinesError> {
            let mut state = self.inner.lock();
            let region = match state.ensure_configured() {
                Ok(config) => config
                    .cloud_api_settings
                    .get("region")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                Err(cause) => {
                    return Err(StartMachinesError {
                        requested: count,
                        started: Vec::new(),
                        cause,
                    })
                }
            };
            state.start_calls += 1;

            let mut started = Vec::new();
            for _ in 0..count {
                if let Some(capacity) = state.start_capacity {
                    if capacity == 0 {
                        return Err(StartMachinesError {
                            requested: count,
                            started,
                            cause: DriverError::Backend("insufficient capacity".to_string()),
                        });
                    }
                    state.start_capacity = Some(capacity - 1);
                }
                state.next_id += 1;
                let now = Utc::now();
                let mut machine = Machine::new(format!("mock-{}", state.next_id), MachineState::Pending)
                    .with_placement("mock", region.clone(), "small")
                    .with_launch_time(now);
                machine.request_time = Some(now);
                state.machines.push(machine.clone());
                started.push(machine);
            }
            Ok(started)
        }

        async fn terminate_machines(
            &self,
            machine_ids: &[String],
        ) -> Result<(), TerminateMachinesError> {
            let mut state = self.inner.lock();
            let mut terminated = Vec::new();
            let mut errors = BTreeMap::new();

            if let Err(e) = state.ensure_configured() {
                for id in machine_ids {
                    errors.insert(id.clone(), e.clone());
                }
                return Err(TerminateMachinesError { terminated, errors });
            }
            state.terminate_calls += 1;

            for id in machine_ids {
                match state.member_mut(id) {
                    Ok(machine) => {
                        machine.machine_state = MachineState::Terminated;
                        terminated.push(id.clone());
                    }
                    Err(e) => {
                        errors.insert(id.clone(), e);
                    }
                }
            }

            if errors.is_empty() {
                Ok(())
            } else {
                Err(TerminateMachinesError { terminated, errors })
            }
        }

        async fn attach_machine(&self, machine_id: &str) -> DriverResult<()> {
            let mut state = self.inner.lock();
            state.ensure_configured()?;
            if state.machines.iter().any(|m| m.id == machine_id) {
                return Ok(());
            }
            let machine = state
                .detached
                .remove(machine_id)
                .ok_or_else(|| DriverError::NotFound(machine_id.to_string()))?;
            state.machines.push(machine);
            Ok(())
        }

        async fn detach_machine(&self, machine_id: &str) -> DriverResult<()> {
            let mut state = self.inner.lock();
            state.ensure_configured()?;
            let index = state
                .machines
                .iter()
                .position(|m| m.id == machine_id)
                .ok_or_else(|| DriverError::NotFound(machine_id.to_string()))?;
            let machine = state.machines.remove(index);
            state.detached.insert(machine.id.clone(), machine);
            Ok(())
        }

        async fn set_service_state(
            &self,
            machine_id: &str,
            service_state: ServiceState,
        ) -> DriverResult<()> {
            let mut state = self.inner.lock();
            state.ensure_configured()?;
            state.member_mut(machine_id)?.service_state = service_state;
            Ok(())
        }

        async fn set_membership_status(
            &self,
            machine_id: &str,
            status: MembershipStatus,
        ) -> DriverResult<()> {
            let mut state = self.inner.lock();
            state.ensure_configured()?;
            state.member_mut(machine_id)?.membership_status = status;
            Ok(())
        }

        fn pool_name(&self) -> DriverResult<String> {
            self.inner
                .lock()
                .ensure_configured()
                .map(|config| config.pool_name.clone())
        }

        fn pool_identifier(&self) -> &str {
            "Mock"
        }
    }
}
