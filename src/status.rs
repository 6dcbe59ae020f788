//! Exception status codes.
//!
//! The codes raised on protocol violations mirror the NT status values the OS
//! dispatcher itself uses, so that a fault surfacing from this library is
//! indistinguishable from one surfacing from `RtlDispatchException`/`RtlUnwind`.
//! Two additional codes in the customer range (`0xE...`) report failures of the
//! origin heuristic.

/// Generic failure.
pub const STATUS_UNSUCCESSFUL: u32 = 0xC000_0001;

/// A handler continued execution on a non-continuable exception.
pub const STATUS_NONCONTINUABLE_EXCEPTION: u32 = 0xC000_0025;

/// A handler returned an invalid disposition.
pub const STATUS_INVALID_DISPOSITION: u32 = 0xC000_0026;

/// Code of the descriptor synthesised by an unwind that was not given one.
pub const STATUS_UNWIND: u32 = 0xC000_0027;

/// A registration record was outside the stack or misaligned during an unwind.
pub const STATUS_BAD_STACK: u32 = 0xC000_0028;

/// The unwind target can not appear on the chain.
pub const STATUS_INVALID_UNWIND_TARGET: u32 = 0xC000_0029;

/// The handler's image does not permit structured exception handling.
pub const STATUS_INVALID_EXCEPTION_HANDLER: u32 = 0xC000_01A5;

/// Integer division by zero.
pub const STATUS_INTEGER_DIVIDE_BY_ZERO: u32 = 0xC000_0094;

/// Access violation.
pub const STATUS_ACCESS_VIOLATION: u32 = 0xC000_0005;

/// The throw-path calibration walk captured too few frames.
pub const STATUS_TRACE_CAPTURE_FAILED: u32 = 0xE000_0028;

/// The origin heuristic could not classify an exception.
pub const STATUS_ORIGIN_UNRESOLVED: u32 = 0xE000_0029;

/// Code raised by the calibration probe; never escapes calibration.
pub const STATUS_CALIBRATION_PROBE: u32 = 0xE000_0030;
