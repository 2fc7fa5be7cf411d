// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared test doubles and fixtures for Echo pipeline crates.
#![forbid(unsafe_code)]
//!
//! # Modules
//!
//! - [`config`] - In-memory config store fake for testing without filesystem
//! - [`probe`] - Lifecycle event recorder (stage windows, write-back order)
//!
//! The simulated operation and its payload builder live in
//! [`echo_pipeline::sim`] and are re-exported here for test convenience.

pub mod config;
pub mod probe;

// Re-export commonly used items at crate root for convenience
pub use config::InMemoryConfigStore;
pub use probe::{Probe, Window};
pub use echo_pipeline::sim::{sim_catalogue, SimOperation, SimPayload, SIM_OP};
