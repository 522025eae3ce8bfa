//! System-wide constants for the Hermes workspace.
//!
//! Single source of truth for numeric limits, defaults and names shared by
//! the supervisor and the module runtime client.

/// Maximum number of modules in one simulation run.
pub const MAX_MODULES: usize = 64;

/// Maximum byte length of a module name (fixed-width field in shared memory).
pub const MAX_MODULE_NAME_LEN: usize = 32;

/// Maximum byte length of a signal name (fixed-width field in shared memory).
pub const MAX_SIGNAL_NAME_LEN: usize = 64;

/// Default number of signal slots reserved per module.
pub const DEFAULT_SIGNALS_PER_MODULE: u32 = 64;

/// Upper bound on signal slots per module.
pub const MAX_SIGNALS_PER_MODULE: u32 = 4096;

/// Prefix of supervisor-generated segment names (`/hermes_<pid>`).
pub const SHM_PREFIX: &str = "/hermes_";

/// Maximum total segment size (64 MB).
pub const SHM_MAX_SIZE: usize = 64 * 1024 * 1024;

/// Cache line size used for layout alignment.
pub const CACHE_LINE_SIZE: usize = 64;

/// Environment variable carrying the module name into a spawned module.
pub const MODULE_ENV_VAR: &str = "HERMES_MODULE";

/// Default simulation rate.
pub const DEFAULT_RATE_HZ: f64 = 100.0;

/// Default time to wait for every spawned module to attach.
pub const DEFAULT_ATTACH_TIMEOUT_MS: u64 = 5000;

/// Default time to wait for an ack to STAGE, RESET, PAUSE or RESUME.
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 2000;

/// Default barrier deadline for a single STEP.
pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 1000;

/// Default grace period between TERMINATE and force-kill.
pub const DEFAULT_TERMINATE_GRACE_MS: u64 = 5000;

/// Longest single futex sleep while waiting on a peer, so liveness is
/// re-checked at least this often.
pub const LIVENESS_POLL_MS: u64 = 20;

/// Nanoseconds per second, used for deterministic time keeping.
pub const NANOS_PER_SECOND: u64 = 1_000_000_000;
