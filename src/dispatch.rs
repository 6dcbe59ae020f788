//! First-pass exception dispatch.
//!
//! [`Dispatcher::dispatch`] is the search for a handler that runs when a fault is
//! reported: it walks the registration chain from the newest record outward, calling
//! each handler through the nested exception trampoline until one of them resolves the
//! exception or the chain runs out. Nothing is unwound here; handlers that want to
//! transfer control to their own frame call [`crate::Unwinder::unwind`] themselves.
//!
//! # Nested exceptions
//!
//! A handler may fault while it runs. The dispatch of that second fault walks into the
//! guard the trampoline linked ahead of the busy handler and is told which frame was
//! busy. From there on the second exception carries [`ExceptionFlags::NESTED_CALL`],
//! up to and including the busy frame itself, after which the flag is cleared. When
//! several frames report, the oldest one (highest address) bounds the region.

use std::ptr;

use log::{debug, trace, warn};

use crate::{
    chain::{address_of, ExceptionChain, RegistrationRecord, CHAIN_END},
    filter::{DispatchFilter, NoCheck},
    handler::{self, Mode},
    record::{Context, Disposition, ExceptionFlags, ExceptionRecord},
    Error,
};

/// How a dispatch pass ended.
///
/// None of these is acted on by the dispatcher itself; the caller turns them into the
/// corresponding (non-returning) system primitive.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The filter left the exception to the operating system.
    Defer,
    /// A handler resolved the exception; resume at the (possibly modified) context.
    ContinueExecution,
    /// No handler resolved the exception, or the chain is corrupt
    /// ([`ExceptionFlags::STACK_INVALID`] tells these apart). Re-raise the original
    /// exception as second chance.
    Unhandled,
    /// A handler violated the protocol; raise the secondary exception described by the
    /// error.
    Fatal(Error),
}

/// Walks a registration chain on behalf of a fault.
///
/// # Example
///
/// ```rust
/// use sehveh::{
///     chain::{ExceptionChain, LocalChain, RegistrationRecord},
///     Context, DispatchOutcome, Dispatcher, ExceptionFlags, ExceptionRecord,
/// };
///
/// unsafe extern "system" fn resolve(
///     _: *mut ExceptionRecord,
///     _: *mut RegistrationRecord,
///     context: *mut Context,
///     _: *mut *mut RegistrationRecord,
/// ) -> i32 {
///     (*context).eax = 1;
///     0 // ContinueExecution
/// }
///
/// let chain = LocalChain::around_current(1 << 20);
/// let mut record = RegistrationRecord::new(resolve);
/// unsafe { record.link(&chain) };
///
/// let mut exception = ExceptionRecord::new(0xC000_0094, ExceptionFlags::empty());
/// let mut context = Context::default();
/// let outcome = unsafe { Dispatcher::new(chain).dispatch(&mut exception, &mut context) };
///
/// assert!(matches!(outcome, DispatchOutcome::ContinueExecution));
/// assert_eq!(context.eax, 1);
/// unsafe { record.unlink(&chain) };
/// ```
#[derive(Debug, Clone)]
pub struct Dispatcher<C, F = NoCheck> {
    chain: C,
    filter: F,
}

impl<C: ExceptionChain> Dispatcher<C> {
    /// Creates a dispatcher that handles every exception.
    pub fn new(chain: C) -> Self {
        Self::with_filter(chain, NoCheck)
    }
}

impl<C: ExceptionChain, F: DispatchFilter> Dispatcher<C, F> {
    /// Creates a dispatcher that consults `filter` first.
    pub fn with_filter(chain: C, filter: F) -> Self {
        Self { chain, filter }
    }

    /// The chain this dispatcher walks.
    pub fn chain(&self) -> &C {
        &self.chain
    }

    /// The filter this dispatcher consults.
    pub fn filter(&self) -> &F {
        &self.filter
    }

    /// Searches the chain for a handler of `exception`.
    ///
    /// Flags are accumulated on `exception` as the pass progresses, and handlers may
    /// modify `context` before asking to continue execution.
    ///
    /// # Safety
    ///
    /// Every record on the chain must either fail stack validation or be a valid record
    /// whose handler upholds the [`crate::chain::ExceptionRoutine`] contract.
    pub unsafe fn dispatch(
        &self,
        exception: &mut ExceptionRecord,
        context: &mut Context,
    ) -> DispatchOutcome {
        match self.filter.should_defer(&self.chain, exception, context) {
            Ok(true) => return DispatchOutcome::Defer,
            Ok(false) => {}
            Err(error) => {
                warn!("Exception filter failed for {:#x} - {error}", exception.code);
                return DispatchOutcome::Fatal(error);
            }
        }

        // Handlers get raw pointers and may keep them across nested passes.
        let exception: *mut ExceptionRecord = exception;
        let context: *mut Context = context;

        let limits = self.chain.stack_limits();
        let mut nested_frame: *mut RegistrationRecord = ptr::null_mut();
        let mut frame = self.chain.head();

        while frame != CHAIN_END {
            if !limits.contains_record(frame) {
                warn!(
                    "Registration record {:#x} is outside the stack {:#x}..{:#x} or misaligned",
                    address_of(frame),
                    limits.low,
                    limits.high
                );
                (*exception).flags |= ExceptionFlags::STACK_INVALID;
                break;
            }

            trace!(
                "Dispatching {:#x} ({:?}) to record {:#x}",
                (*exception).code,
                (*exception).flags,
                address_of(frame)
            );
            let invocation = handler::invoke(&self.chain, Mode::Dispatch, exception, frame, context);

            if frame == nested_frame {
                (*exception).flags.remove(ExceptionFlags::NESTED_CALL);
                nested_frame = ptr::null_mut();
            }

            match invocation.disposition {
                Ok(Disposition::ContinueExecution) => {
                    if !(*exception).is_continuable() {
                        warn!(
                            "Record {:#x} continued non-continuable exception {:#x}",
                            address_of(frame),
                            (*exception).code
                        );
                        return DispatchOutcome::Fatal(Error::NoncontinuableContinued);
                    }

                    debug!(
                        "Record {:#x} resolved exception {:#x}",
                        address_of(frame),
                        (*exception).code
                    );
                    return DispatchOutcome::ContinueExecution;
                }
                Ok(Disposition::ContinueSearch) => {
                    if (*exception).flags.contains(ExceptionFlags::STACK_INVALID) {
                        break;
                    }
                }
                Ok(Disposition::NestedException) => {
                    (*exception).flags |= ExceptionFlags::NESTED_CALL;

                    let reported = invocation.dispatcher_context;
                    if address_of(reported) > address_of(nested_frame) {
                        nested_frame = reported;
                    }
                    debug!(
                        "Nested exception while record {:#x} was handling, marking up to {:#x}",
                        address_of(reported),
                        address_of(nested_frame)
                    );
                }
                Ok(other) => {
                    warn!(
                        "Record {:#x} returned {other} during dispatch",
                        address_of(frame)
                    );
                    return DispatchOutcome::Fatal(Error::InvalidDisposition(other.into()));
                }
                Err(raw) => {
                    warn!(
                        "Record {:#x} returned invalid disposition {raw}",
                        address_of(frame)
                    );
                    return DispatchOutcome::Fatal(Error::InvalidDisposition(raw));
                }
            }

            frame = (*frame).next;
        }

        DispatchOutcome::Unhandled
    }
}
