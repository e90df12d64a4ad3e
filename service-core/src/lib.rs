//! service-core: error taxonomy, layered configuration and tracing setup
//! shared by the donation platform crates.
pub mod config;
pub mod error;
pub mod observability;
