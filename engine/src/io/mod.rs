//! Persistence backends, shard storage and configuration.

pub mod backend;
pub mod config;
pub mod shard_store;
