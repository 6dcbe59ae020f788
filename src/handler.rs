//! Handler invocation with nested exception detection.
//!
//! A handler invoked by a dispatch or unwind pass may itself fault, or may start an
//! unwind of its own. The pass that handles *that* event has to learn which outer frame
//! was busy when it happened, but by then control has left the outer pass mid-call. The
//! trampoline in this module solves this the way the NT dispatcher does: before calling
//! a handler it links a small guard record ahead of it on the chain. The guard carries
//! the handler's establisher frame, and its routine (the *nested detector*) reports
//! that frame back to any inner pass that walks into it.
//!
//! ```text
//!   head -> [guard | detector] -> [frame | handler] -> ... -> CHAIN_END
//!             |
//!             +-- establisher = frame
//! ```
//!
//! An inner dispatch reaching the guard receives [`Disposition::NestedException`], an
//! inner unwind receives [`Disposition::CollidedUnwind`]; either way the dispatcher
//! context names the outer frame. A pass of the other kind walks straight through the
//! guard, which answers [`Disposition::ContinueSearch`].

use std::ptr;

use crate::{
    chain::{ExceptionChain, ExceptionRoutine, RegistrationRecord},
    record::{Context, Disposition, ExceptionRecord},
};

/// Which kind of pass a handler is being invoked from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// A first-pass search for a handler of a new exception.
    Dispatch,
    /// A walk discarding frames on the way to an unwind target.
    Unwind,
}

impl Mode {
    /// The detector routine that guards handlers invoked in this mode.
    #[must_use]
    pub fn detector(self) -> ExceptionRoutine {
        match self {
            Mode::Dispatch => nested_detector::<false>,
            Mode::Unwind => nested_detector::<true>,
        }
    }
}

/// The result of invoking one handler.
///
/// A handler answers through two channels: the returned disposition and the dispatcher
/// context slot it may fill in. Both are kept together here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Invocation {
    /// The decoded disposition, or the raw value if it is not a known disposition.
    pub disposition: Result<Disposition, i32>,
    /// The frame reported alongside [`Disposition::NestedException`] or
    /// [`Disposition::CollidedUnwind`]; null otherwise.
    pub dispatcher_context: *mut RegistrationRecord,
}

/// The guard linked ahead of a handler while it runs.
///
/// The detector is handed a pointer to `record` as its establisher frame and finds
/// `establisher` in the word right after it.
#[repr(C)]
struct NestedGuardFrame {
    record: RegistrationRecord,
    establisher: *mut RegistrationRecord,
}

/// Unlinks the guard when the handler returns.
struct GuardLink<'a, C: ExceptionChain + ?Sized> {
    chain: &'a C,
    record: *mut RegistrationRecord,
}

impl<'a, C: ExceptionChain + ?Sized> GuardLink<'a, C> {
    unsafe fn new(chain: &'a C, record: *mut RegistrationRecord) -> Self {
        (*record).next = chain.head();
        chain.set_head(record);
        Self { chain, record }
    }
}

impl<C: ExceptionChain + ?Sized> Drop for GuardLink<'_, C> {
    fn drop(&mut self) {
        // An inner unwind that collided with this frame has already unlinked the guard
        // together with the frame it protects.
        if self.chain.head() == self.record {
            // SAFETY: the guard is still the head, so its `next` is the head it replaced.
            unsafe { self.chain.set_head((*self.record).next) };
        }
    }
}

/// Calls the handler of `frame` with a nested exception guard in place.
///
/// # Arguments
///
/// * `chain` - The chain of the current thread
/// * `mode` - The kind of pass performing the call
/// * `exception` - The exception being dispatched or the unwind descriptor
/// * `frame` - The registration record whose handler is called
/// * `context` - The register context passed through to the handler
///
/// # Safety
///
/// `frame` must be a valid registration record whose handler upholds the
/// [`ExceptionRoutine`] contract, and `exception` and `context` must be valid for the
/// duration of the call.
pub unsafe fn invoke<C: ExceptionChain + ?Sized>(
    chain: &C,
    mode: Mode,
    exception: *mut ExceptionRecord,
    frame: *mut RegistrationRecord,
    context: *mut Context,
) -> Invocation {
    let mut guard = NestedGuardFrame {
        record: RegistrationRecord::new(mode.detector()),
        establisher: frame,
    };
    let mut dispatcher_context: *mut RegistrationRecord = ptr::null_mut();

    let raw = {
        let _linked = GuardLink::new(chain, ptr::addr_of_mut!(guard).cast());
        ((*frame).handler)(exception, frame, context, &mut dispatcher_context)
    };

    Invocation {
        disposition: Disposition::from_repr(raw).ok_or(raw),
        dispatcher_context,
    }
}

/// The routine of a nested exception guard.
///
/// Answers only passes of the kind it guards (`UNWIND` selects which), reporting the
/// guarded handler's establisher frame. Any other pass sees `ContinueSearch`.
unsafe extern "system" fn nested_detector<const UNWIND: bool>(
    exception: *mut ExceptionRecord,
    establisher_frame: *mut RegistrationRecord,
    _context: *mut Context,
    dispatcher_context: *mut *mut RegistrationRecord,
) -> i32 {
    if (*exception).is_unwinding() != UNWIND {
        return Disposition::ContinueSearch.into();
    }

    let guard = establisher_frame.cast::<NestedGuardFrame>();
    *dispatcher_context = (*guard).establisher;

    if UNWIND {
        Disposition::CollidedUnwind.into()
    } else {
        Disposition::NestedException.into()
    }
}
