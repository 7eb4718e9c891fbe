//! Deterministic, pure logic shared by the engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! JSON documents and return deterministic outputs suitable for tests.

pub mod batch;
pub mod executor;
pub mod path;
pub mod policy;
pub mod schema;
pub mod shards;
pub mod types;
pub mod validator;
