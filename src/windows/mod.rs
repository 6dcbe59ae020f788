//! The Windows x86 backend.
//!
//! Binds the portable [`Dispatcher`] and [`Unwinder`] to the native registration
//! chain at `fs:[0]` and to the system's exception delivery:
//!
//! - [`enable`]/[`disable`] install and remove [`vectored_dispatch`] as the last
//!   consulted vectored exception handler.
//! - [`vectored_dispatch`] runs the dispatch pass for every exception the earlier
//!   vectored handlers pass on, before the OS's own (SafeSEH validating) dispatcher
//!   gets to see it.
//! - [`unwind`] replaces `RtlUnwind` for handlers that want to unwind to their frame.
//! - [`raise`] raises a software exception through the path the origin heuristic is
//!   calibrated against.
//!
//! Every outcome that leaves the normal call/return flow ends in one of the
//! non-returning primitives of `ntdll`.

mod modules;
mod ntdll;
mod trace;

pub use modules::LoadedModules;
pub use trace::DbgHelpTracer;

use std::{
    ffi::c_void,
    ptr::NonNull,
    sync::{Mutex, OnceLock},
};

use log::debug;
use windows_sys::Win32::System::Diagnostics::Debug::{
    AddVectoredExceptionHandler, RaiseException, RemoveVectoredExceptionHandler,
    EXCEPTION_CONTINUE_EXECUTION, EXCEPTION_CONTINUE_SEARCH, EXCEPTION_POINTERS,
};

use crate::{
    chain::{RegistrationRecord, TebChain},
    config::{self, ActiveFilter},
    enablement::{Enablement, HandlerInstaller},
    record::{Context, ExceptionFlags, ExceptionRecord, EXCEPTION_MAXIMUM_PARAMETERS},
    DispatchOutcome, Dispatcher, Error, Result, UnwindOutcome, UnwindTarget, Unwinder,
};

/// Number of stack arguments of [`unwind`].
const UNWIND_ARGUMENTS: u32 = 4;

/// The filter policy, prepared on the first successful enable.
static FILTER: OnceLock<ActiveFilter> = OnceLock::new();

/// The process-wide installation state.
static STATE: Mutex<Enablement<VectoredInstaller>> =
    Mutex::new(Enablement::new(VectoredInstaller));

/// Installs the exception dispatcher.
///
/// Does nothing if it is already installed. The first call also prepares the filter
/// policy the crate was built with, which for `origin-check` includes calibrating the
/// throw path.
///
/// # Errors
///
/// - [`Error::InstallFailed`] if the vectored handler could not be registered
/// - [`Error::TraceCapture`] if the throw path calibration failed
pub fn enable() -> Result<()> {
    lock!(STATE).enable()
}

/// Removes the exception dispatcher. Does nothing if it is not installed.
pub fn disable() {
    lock!(STATE).disable();
}

/// Whether the exception dispatcher is installed.
pub fn is_enabled() -> bool {
    lock!(STATE).is_enabled()
}

/// Registration of [`vectored_dispatch`] with the OS.
#[derive(Debug)]
pub struct VehHandle(NonNull<c_void>);

// SAFETY: the handle is an opaque cookie, valid for removal from any thread.
unsafe impl Send for VehHandle {}

/// Adds and removes [`vectored_dispatch`].
#[derive(Debug, Default)]
pub struct VectoredInstaller;

impl HandlerInstaller for VectoredInstaller {
    type Handle = VehHandle;

    fn install(&mut self) -> Result<VehHandle> {
        if FILTER.get().is_none() {
            debug!("Preparing {} exception checking", config::CHECKING);
            // A concurrent enable is excluded by STATE, so the slot is still empty.
            let _ = FILTER.set(active_filter()?);
        }

        // SAFETY: vectored_dispatch matches PVECTORED_EXCEPTION_HANDLER.
        let handle = unsafe { AddVectoredExceptionHandler(0, Some(vectored_dispatch)) };
        NonNull::new(handle)
            .map(VehHandle)
            .ok_or(Error::InstallFailed)
    }

    fn remove(&mut self, handle: VehHandle) {
        // SAFETY: the handle came from AddVectoredExceptionHandler and is removed once.
        unsafe { RemoveVectoredExceptionHandler(handle.0.as_ptr()) };
    }
}

#[cfg(not(any(feature = "origin-check", feature = "safe-handler-check")))]
fn active_filter() -> Result<ActiveFilter> {
    Ok(crate::filter::NoCheck)
}

#[cfg(feature = "origin-check")]
fn active_filter() -> Result<ActiveFilter> {
    let signature = trace::calibrate()?;
    let module = modules::module_range(vectored_dispatch as usize)
        .ok_or(Error::OriginUnresolved)??;

    Ok(crate::filter::OriginFilter::new(DbgHelpTracer, signature, module))
}

#[cfg(feature = "safe-handler-check")]
fn active_filter() -> Result<ActiveFilter> {
    Ok(crate::filter::SafeHandlerFilter::new(LoadedModules))
}

/// The vectored exception handler running the dispatch pass.
///
/// Returns `EXCEPTION_CONTINUE_SEARCH` when the filter defers to the OS and
/// `EXCEPTION_CONTINUE_EXECUTION` when a handler resolved the exception. Every other
/// outcome raises and does not return.
///
/// # Safety
///
/// Only to be called by the OS exception dispatcher.
pub unsafe extern "system" fn vectored_dispatch(info: *mut EXCEPTION_POINTERS) -> i32 {
    let Some(filter) = FILTER.get() else {
        return EXCEPTION_CONTINUE_SEARCH;
    };

    let exception = &mut *(*info).ExceptionRecord.cast::<ExceptionRecord>();
    let context = &mut *(*info).ContextRecord.cast::<Context>();

    match Dispatcher::with_filter(TebChain, filter).dispatch(exception, context) {
        DispatchOutcome::Defer => EXCEPTION_CONTINUE_SEARCH,
        DispatchOutcome::ContinueExecution => EXCEPTION_CONTINUE_EXECUTION,
        DispatchOutcome::Unhandled => ntdll::raise_second_chance(exception, context),
        DispatchOutcome::Fatal(error) => raise_error(error, exception, context),
    }
}

/// Raises the secondary exception for `error`, chained to `exception`.
unsafe fn raise_error(error: Error, exception: &mut ExceptionRecord, context: &Context) -> ! {
    let first_chance = error.first_chance();
    let secondary = error.into_record(exception);

    if first_chance {
        ntdll::raise_first_chance(&secondary)
    } else {
        ntdll::raise_second_chance(&secondary, context)
    }
}

/// Unwinds the chain to `target_frame` and resumes in the caller with `return_value`.
///
/// Has the shape of `RtlUnwind`:
///
/// - a null `target_frame` unwinds everything and then raises the (exit) unwind
///   descriptor as unhandled
/// - [`crate::chain::CHAIN_END`] unwinds everything and returns to the caller
/// - any other value unwinds up to, but not including, that record
///
/// `target_ip` is accepted for compatibility and ignored: like the native x86
/// implementation, execution always continues right after this call. A null
/// `exception` is replaced by a `STATUS_UNWIND` descriptor.
///
/// The continuation is recovered from this function's EBP frame, so the caller and
/// `sehveh` must both be compiled with `-C force-frame-pointers=yes`. The setting in
/// this repository's `.cargo/config.toml` does not reach dependent crates; they have to
/// set the flag in their own build configuration.
///
/// # Safety
///
/// Must be called on a thread whose chain is well formed, with a `target_frame` that is
/// on that chain (or one of the two sentinels). Frames between the head and the target
/// are abandoned without running their destructors.
#[inline(never)]
pub unsafe extern "system" fn unwind(
    target_frame: *mut RegistrationRecord,
    _target_ip: *mut c_void,
    exception: *mut ExceptionRecord,
    return_value: *mut c_void,
) {
    let mut continuation = Context::default();
    ntdll::RtlCaptureContext(&mut continuation);
    continuation.pop_arguments(UNWIND_ARGUMENTS);

    let mut synthesized = ExceptionRecord::unwind_request(continuation.instruction_pointer());
    let exception = match exception.as_mut() {
        Some(exception) => exception,
        None => &mut synthesized,
    };

    let target = UnwindTarget::from_raw(target_frame);
    match Unwinder::new(TebChain).unwind(target, exception, continuation, return_value as usize) {
        UnwindOutcome::Resume(context) => ntdll::resume(&context),
        UnwindOutcome::Unhandled(context) => ntdll::raise_second_chance(exception, &context),
        UnwindOutcome::Fatal(error) => raise_error(error, exception, &continuation),
    }
}

/// Raises a software exception.
///
/// At most [`EXCEPTION_MAXIMUM_PARAMETERS`] arguments are passed on. This is the throw
/// path the `origin-check` policy is calibrated against; exceptions raised through it
/// are attributed to the caller.
///
/// # Safety
///
/// Control may leave the caller through a registered handler's unwind.
#[inline(never)]
pub unsafe fn raise(code: u32, flags: ExceptionFlags, arguments: &[usize]) {
    let count = arguments.len().min(EXCEPTION_MAXIMUM_PARAMETERS);
    RaiseException(code, flags.bits(), count as u32, arguments.as_ptr());
}
