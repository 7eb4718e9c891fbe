//! Path-addressed command engine with sharded persistence.
//!
//! An external generative process mutates a nested game-state document (the
//! aggregate) through a small instruction set (`set`, `add`, `push`, `pull`,
//! `delete`). Every command is validated against an allow-list path policy
//! before it touches the document, and the document is persisted as a set of
//! independently addressable shards. The architecture keeps a strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (path resolution, validation,
//!   command application, shard codec). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (key-value backends, shard store,
//!   configuration files). Isolated behind traits to enable mocking in tests.
//!
//! [`controller`] coordinates core logic with I/O for one session at a time.

pub mod controller;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
