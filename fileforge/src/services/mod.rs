//! Service layer module.
//!
//! Wires configuration into running services and owns their lifecycle.

pub mod container;

pub use container::ServiceContainer;
