//! Stable exit codes for engine CLI commands.

/// Command succeeded and every submitted command was accepted.
pub const OK: i32 = 0;
/// Invalid input, config, session id, or a storage error.
pub const INVALID: i32 = 1;
/// The batch ran but at least one command was rejected.
pub const REJECTED: i32 = 2;
