// error.rs — Fatal error type and the process-wide error channel.
//
// Every device-facing operation in this crate returns `Result<T, FatalError>`.
// A `FatalError` is never retried: the caller either propagates it with `?`
// or hands it to `FatalError::abort`, which routes through `report_fatal`
// and terminates the thread with a diagnostic.
//
// STATUS CODES
// ────────────
// `Status` is a small symbolic code, stable across releases, so that a log
// line like `BUILD_PROGRAM_FAILURE` can be grepped for regardless of the
// free-form message attached to it.
//
// CALL-SITE CONTEXT
// ─────────────────
// `FatalError::new` is `#[track_caller]`, so the recorded location is the
// line that detected the failure, not this file.

use std::fmt;
use std::panic::Location;

/// Symbolic status attached to every [`FatalError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// No adapter could be enumerated.
    DeviceNotFound,
    /// The adapter refused the device request (limits, features, driver).
    DeviceRequestFailed,
    /// Allocation failed on the device.
    OutOfResources,
    /// An argument was malformed: wrong data length, zero size, empty set.
    InvalidValue,
    /// A copy or readback region overruns its image or buffer.
    OutOfBounds,
    /// Kernel source failed to compile or the pipeline could not be built.
    BuildProgramFailure,
    /// A kernel was dispatched with a missing or mistyped argument.
    InvalidKernelArgs,
    /// The device rejected a command (validation layer).
    ValidationFailed,
    /// Mapping a buffer for host access failed.
    MapFailure,
    /// A CG scalar became NaN or infinite.
    NonFiniteValue,
}

impl Status {
    /// Stable, upper-case name used in logs.
    pub fn name(self) -> &'static str {
        match self {
            Status::DeviceNotFound => "DEVICE_NOT_FOUND",
            Status::DeviceRequestFailed => "DEVICE_REQUEST_FAILED",
            Status::OutOfResources => "OUT_OF_RESOURCES",
            Status::InvalidValue => "INVALID_VALUE",
            Status::OutOfBounds => "OUT_OF_BOUNDS",
            Status::BuildProgramFailure => "BUILD_PROGRAM_FAILURE",
            Status::InvalidKernelArgs => "INVALID_KERNEL_ARGS",
            Status::ValidationFailed => "VALIDATION_FAILED",
            Status::MapFailure => "MAP_FAILURE",
            Status::NonFiniteValue => "NON_FINITE_VALUE",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A non-recoverable failure with its status and the call site that raised it.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{status}: {message} (at {location})")]
pub struct FatalError {
    pub status: Status,
    pub message: String,
    pub location: &'static Location<'static>,
}

impl FatalError {
    /// Build an error at the caller's location.
    #[track_caller]
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        FatalError {
            status,
            message: message.into(),
            location: Location::caller(),
        }
    }

    /// Hand the error to the process-wide channel. Never returns.
    pub fn abort(self) -> ! {
        report_fatal(&self.message, &[&self.status, &self.location])
    }
}

/// Crate-wide result alias.
pub type Result<T, E = FatalError> = std::result::Result<T, E>;

/// The process-wide fatal error channel.
///
/// Synchronous failures reach it through [`FatalError::abort`]; asynchronous
/// device notifications reach it from the uncaptured-error callback that
/// `GpuDevice` installs at creation. Logs the message and every diagnostic
/// value, then panics.
pub fn report_fatal(message: &str, diagnostics: &[&dyn fmt::Debug]) -> ! {
    let details: Vec<String> = diagnostics.iter().map(|d| format!("{d:?}")).collect();
    tracing::error!(diagnostics = ?details, "fatal: {message}");
    panic!("fatal: {message} {details:?}");
}

// ============================================================
// Tests
// ============================================================
