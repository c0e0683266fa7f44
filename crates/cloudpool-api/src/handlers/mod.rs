//! HTTP request handlers.
//!
//! This module contains all the endpoint handlers for the pool API.

pub mod lifecycle;
pub mod pool;
pub mod service;
