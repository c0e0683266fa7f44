//! REST API for the cloudpool reconciliation engine.
//!
//! This crate exposes the operations of a [`CloudPool`] over HTTP. It is a
//! thin dispatcher: every handler maps one request onto one engine call and
//! maps engine errors onto status codes.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Clients                               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     cloudpool-api                            │
//! │  ┌─────────────┐ ┌─────────────┐ ┌─────────────────────┐   │
//! │  │  Trace /    │ │   Router    │ │    ApiError         │   │
//! │  │  Limits     │ │  + Handlers │ │    mapping          │   │
//! │  └─────────────┘ └─────────────┘ └─────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!                    ┌──────────────────┐
//!                    │  cloudpool-engine │
//!                    │  (CloudPool)      │
//!                    └──────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use cloudpool_api::{create_router, ApiConfig, ApiState};
//! use cloudpool_engine::{BaseCloudPool, CloudPoolDriver};
//! use cloudpool_store::RocksStore;
//!
//! # async fn example(driver: Arc<dyn CloudPoolDriver>) -> Result<(), Box<dyn std::error::Error>> {
//! let config = ApiConfig::from_env();
//! let store = Arc::new(RocksStore::open(&config.data_dir)?);
//! let pool = Arc::new(BaseCloudPool::with_log_alerts(driver, store));
//!
//! let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
//! let app = create_router(ApiState::new(pool, config));
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use config::ApiConfig;
pub use error::ApiError;
pub use routes::create_router;
pub use state::ApiState;

// Re-export for handler signatures
pub use cloudpool_engine::CloudPool;
