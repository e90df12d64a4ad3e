//! Donation Service - sharded campaign and donation store with a consistent
//! donation workflow.

pub mod config;
pub mod models;
pub mod services;
pub mod sharding;
pub mod startup;
pub mod store;
