//! Stable exit codes for the upgrader CLI.

/// The requested command succeeded (for `upgrade`: the run completed).
pub const OK: i32 = 0;
/// Invalid input, corrupt status file, or another fatal error.
pub const INVALID: i32 = 1;
/// The run ended in `ERROR_REPORT`: build errors remain unresolved.
pub const UNRESOLVED: i32 = 2;
/// The run ended in `TEST_ERROR_REPORT`: test failures remain unresolved.
pub const TEST_UNRESOLVED: i32 = 3;
