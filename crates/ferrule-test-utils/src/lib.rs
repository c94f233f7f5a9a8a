#![deny(unsafe_code)]

//! Shared test utilities for the Ferrule workspace.
//!
//! Provides reusable fixtures, config builders, and tracing helpers so that
//! individual crate tests stay concise and consistent.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! ferrule-test-utils = { workspace = true }
//! ```

pub mod channel;
pub mod config;
pub mod socket;
pub mod tracing_setup;
