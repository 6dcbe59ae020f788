//! The native primitives behind every terminal outcome.
//!
//! None of the wrappers here return. Code after a call to them is unreachable; should
//! the system call itself fail, the process is aborted.

use std::process;

use crate::record::{Context, ExceptionRecord};

#[link(name = "ntdll")]
extern "system" {
    fn NtContinue(context: *const Context, test_alert: u8) -> i32;
    fn NtRaiseException(
        exception: *const ExceptionRecord,
        context: *const Context,
        first_chance: u8,
    ) -> i32;
    fn RtlRaiseException(exception: *const ExceptionRecord);
    pub(super) fn RtlCaptureContext(context: *mut Context);
}

/// Transfers control into `context`.
pub(super) unsafe fn resume(context: &Context) -> ! {
    NtContinue(context, 0);
    process::abort()
}

/// Raises `exception` at `context` without dispatching it again.
///
/// This is the unhandled exception path: the OS goes straight to the debugger and the
/// unhandled exception filter.
pub(super) unsafe fn raise_second_chance(exception: &ExceptionRecord, context: &Context) -> ! {
    NtRaiseException(exception, context, 0);
    process::abort()
}

/// Raises `exception` as a new first-chance exception from the current position.
pub(super) unsafe fn raise_first_chance(exception: &ExceptionRecord) -> ! {
    RtlRaiseException(exception);
    process::abort()
}
