//! Machine model types for cloudpool.
//!
//! This crate provides the value types shared by every other cloudpool crate:
//!
//! - **Machines**: [`Machine`] with its [`MachineState`], [`MembershipStatus`]
//!   and [`ServiceState`]
//! - **Snapshots**: the immutable [`MachinePool`] produced by each successful
//!   fetch, and the derived [`PoolSizeSummary`]
//! - **Status**: the [`CloudPoolStatus`] lifecycle flags
//! - **Metadata**: [`CloudPoolMetadata`], the backend identifier and the API
//!   versions a pool implements
//!
//! # Example
//!
//! ```
//! use cloudpool_core::{Machine, MachinePool, MachineState, MembershipStatus};
//!
//! let pool = MachinePool::new(vec![
//!     Machine::new("i-1", MachineState::Running),
//!     Machine::new("i-2", MachineState::Pending),
//!     Machine::new("i-3", MachineState::Running)
//!         .with_membership_status(MembershipStatus::disposable()),
//! ]);
//!
//! assert_eq!(pool.active_count(), 2);
//! assert_eq!(pool.pending_count(), 1);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod machine;
pub mod metadata;
pub mod pool;

pub use error::{CoreError, Result};
pub use machine::{Machine, MachineState, MembershipStatus, ServiceState};
pub use metadata::CloudPoolMetadata;
pub use pool::{CloudPoolStatus, MachinePool, PoolSizeSummary};
