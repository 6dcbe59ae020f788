//! Frame unwinding.
//!
//! An unwind discards the newest frames of the registration chain on the way to a
//! target frame, giving each discarded frame's handler one last call (with
//! [`ExceptionFlags::UNWINDING`] set) so it can run its cleanup, and then resumes
//! execution in a captured continuation context. It is the second half of every
//! "catch": the handler that decides to take an exception unwinds to its own frame and
//! continues there.
//!
//! # Targets
//!
//! | Raw target   | [`UnwindTarget`] | At the end of the chain |
//! |--------------|------------------|-------------------------|
//! | null         | `Exit`           | re-raise (exit unwind)  |
//! | `CHAIN_END`  | `All`            | resume                  |
//! | a record     | `Frame`          | re-raise (not found)    |
//!
//! The target frame itself is not unwound: the walk stops on reaching it.
//!
//! # Collided unwinds
//!
//! If an unwind handler starts another unwind, the inner unwind reaches the guard
//! linked ahead of that handler and learns which frame the outer unwind was busy with.
//! It continues from there, skipping everything the outer unwind already handled.

use std::ptr::{self, NonNull};

use log::{debug, trace, warn};

use crate::{
    chain::{address_of, ExceptionChain, RegistrationRecord, CHAIN_END},
    handler::{self, Mode},
    record::{Context, Disposition, ExceptionFlags, ExceptionRecord},
    Error,
};

/// Where an unwind stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindTarget {
    /// Unwind the whole chain and then re-raise, resuming nowhere.
    Exit,
    /// Unwind the whole chain and resume at the continuation.
    All,
    /// Unwind the records newer than this one and resume at the continuation.
    Frame(NonNull<RegistrationRecord>),
}

impl UnwindTarget {
    /// Decodes the raw target of the native unwind interface.
    #[must_use]
    pub fn from_raw(target: *mut RegistrationRecord) -> Self {
        if target == CHAIN_END {
            return UnwindTarget::All;
        }

        match NonNull::new(target) {
            Some(frame) => UnwindTarget::Frame(frame),
            None => UnwindTarget::Exit,
        }
    }

    /// The raw target of the native unwind interface.
    #[must_use]
    pub fn as_raw(&self) -> *mut RegistrationRecord {
        match self {
            UnwindTarget::Exit => ptr::null_mut(),
            UnwindTarget::All => CHAIN_END,
            UnwindTarget::Frame(frame) => frame.as_ptr(),
        }
    }
}

/// How an unwind pass ended.
#[derive(Debug)]
pub enum UnwindOutcome {
    /// Transfer control into the continuation.
    Resume(Context),
    /// The target was not reached (or there was none): re-raise the unwind descriptor
    /// as second chance at the continuation.
    Unhandled(Context),
    /// The chain or the target is invalid, or a handler violated the protocol; raise
    /// the secondary exception described by the error.
    Fatal(Error),
}

/// Unwinds a registration chain.
///
/// # Example
///
/// ```rust
/// use sehveh::{
///     chain::{ExceptionChain, LocalChain, RegistrationRecord},
///     Context, ExceptionRecord, UnwindOutcome, UnwindTarget, Unwinder,
/// };
///
/// unsafe extern "system" fn cleanup(
///     _: *mut ExceptionRecord,
///     _: *mut RegistrationRecord,
///     _: *mut Context,
///     _: *mut *mut RegistrationRecord,
/// ) -> i32 {
///     1 // ContinueSearch
/// }
///
/// let chain = LocalChain::around_current(1 << 20);
/// let mut record = RegistrationRecord::new(cleanup);
/// unsafe { record.link(&chain) };
///
/// let mut descriptor = ExceptionRecord::unwind_request(0);
/// let outcome = unsafe {
///     Unwinder::new(chain).unwind(UnwindTarget::All, &mut descriptor, Context::default(), 42)
/// };
///
/// match outcome {
///     UnwindOutcome::Resume(context) => assert_eq!(context.result(), 42),
///     other => panic!("unexpected {other:?}"),
/// }
/// assert!(chain.is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct Unwinder<C> {
    chain: C,
}

impl<C: ExceptionChain> Unwinder<C> {
    /// Creates an unwinder for `chain`.
    pub fn new(chain: C) -> Self {
        Self { chain }
    }

    /// The chain this unwinder walks.
    pub fn chain(&self) -> &C {
        &self.chain
    }

    /// Unwinds the chain towards `target`.
    ///
    /// # Arguments
    ///
    /// * `target` - Where to stop
    /// * `exception` - The exception that caused the unwind, or a descriptor from
    ///   [`ExceptionRecord::unwind_request`]
    /// * `continuation` - The context to resume in, already positioned after the call
    ///   that requested the unwind
    /// * `return_value` - Installed in the continuation's result register
    ///
    /// # Safety
    ///
    /// Every record on the chain must either fail stack validation or be a valid record
    /// whose handler upholds the [`crate::chain::ExceptionRoutine`] contract. Records
    /// unlinked by the unwind are not touched again.
    pub unsafe fn unwind(
        &self,
        target: UnwindTarget,
        exception: &mut ExceptionRecord,
        mut continuation: Context,
        return_value: usize,
    ) -> UnwindOutcome {
        continuation.set_result(return_value);

        exception.flags |= match target {
            UnwindTarget::Exit => ExceptionFlags::UNWINDING | ExceptionFlags::EXIT_UNWIND,
            _ => ExceptionFlags::UNWINDING,
        };

        let exception: *mut ExceptionRecord = exception;
        let target_frame = target.as_raw();
        let limits = self.chain.stack_limits();
        let mut frame = self.chain.head();

        while frame != CHAIN_END {
            if frame == target_frame {
                debug!("Unwind reached target {:#x}", address_of(frame));
                return UnwindOutcome::Resume(continuation);
            }

            if let UnwindTarget::Frame(wanted) = target {
                if address_of(wanted.as_ptr()) < address_of(frame) {
                    warn!(
                        "Unwind target {:#x} is newer than record {:#x}",
                        address_of(wanted.as_ptr()),
                        address_of(frame)
                    );
                    return UnwindOutcome::Fatal(Error::InvalidUnwindTarget {
                        target: address_of(wanted.as_ptr()),
                        frame: address_of(frame),
                    });
                }
            }

            if !limits.contains_record(frame) {
                warn!(
                    "Registration record {:#x} is outside the stack {:#x}..{:#x} or misaligned",
                    address_of(frame),
                    limits.low,
                    limits.high
                );
                return UnwindOutcome::Fatal(Error::BadStack(address_of(frame)));
            }

            trace!("Unwinding record {:#x}", address_of(frame));
            let invocation =
                handler::invoke(&self.chain, Mode::Unwind, exception, frame, &mut continuation);

            match invocation.disposition {
                Ok(Disposition::ContinueSearch) => {}
                Ok(Disposition::CollidedUnwind) => {
                    let collided = invocation.dispatcher_context;
                    if !limits.contains_record(collided) {
                        warn!(
                            "Collided unwind reported invalid record {:#x}",
                            address_of(collided)
                        );
                        return UnwindOutcome::Fatal(Error::BadStack(address_of(collided)));
                    }

                    debug!(
                        "Unwind collided at record {:#x}, continuing from {:#x}",
                        address_of(frame),
                        address_of(collided)
                    );
                    frame = collided;
                }
                Ok(other) => {
                    warn!(
                        "Record {:#x} returned {other} during unwind",
                        address_of(frame)
                    );
                    return UnwindOutcome::Fatal(Error::InvalidDisposition(other.into()));
                }
                Err(raw) => {
                    warn!(
                        "Record {:#x} returned invalid disposition {raw}",
                        address_of(frame)
                    );
                    return UnwindOutcome::Fatal(Error::InvalidDisposition(raw));
                }
            }

            let next = (*frame).next;
            self.chain.set_head(next);
            frame = next;
        }

        if target == UnwindTarget::All {
            debug!("Unwound the whole chain");
            UnwindOutcome::Resume(continuation)
        } else {
            debug!(
                "Unwind target {:#x} not reached",
                address_of(target_frame)
            );
            UnwindOutcome::Unhandled(continuation)
        }
    }
}
