//! The per-thread chain of exception registration records.
//!
//! Every thread owns one singly linked list of [`RegistrationRecord`]s. Each record
//! is embedded in the stack frame that wants to guard a region of code, points at
//! the next older record, and names the routine to call when an exception travels
//! through that frame. The head of the list lives in hardware/ABI defined per-thread
//! storage (`fs:[0]` on x86 Windows) rather than in an ordinary variable.
//!
//! # Key Components
//!
//! - [`RegistrationRecord`] - A stack-resident chain node
//! - [`ExceptionRoutine`] - The signature of a frame-based handler
//! - [`ExceptionChain`] - Access to the running thread's chain head and stack extent
//! - [`StackLimits`] - The bounds every live record must lie within
//! - [`LocalChain`] - A chain rooted in a thread-local slot, usable on any target
//! - `TebChain` - The native chain rooted at `fs:[0]` (x86 Windows only)
//!
//! # Invariants
//!
//! Records are ordered by ascending stack address from the newest record at the head
//! to the [`CHAIN_END`] terminator. A live record lies completely inside the stack
//! limits of its thread and is aligned to the machine word. No synchronization is
//! involved anywhere: a chain is only ever read or written by its own thread.

mod local;
#[cfg(all(windows, target_arch = "x86"))]
mod teb;

pub use local::LocalChain;
#[cfg(all(windows, target_arch = "x86"))]
pub use teb::TebChain;

use std::mem;

use crate::record::{Context, ExceptionRecord};

/// The terminator of every registration chain.
pub const CHAIN_END: *mut RegistrationRecord = usize::MAX as *mut RegistrationRecord;

/// A frame-based exception handler.
///
/// Called with the exception, the record that registered the handler (its
/// *establisher frame*), the register context, and an out slot the handler may fill
/// with a frame reference when it reports [`crate::Disposition::NestedException`] or
/// [`crate::Disposition::CollidedUnwind`]. Returns a raw [`crate::Disposition`].
pub type ExceptionRoutine = unsafe extern "system" fn(
    exception: *mut ExceptionRecord,
    establisher_frame: *mut RegistrationRecord,
    context: *mut Context,
    dispatcher_context: *mut *mut RegistrationRecord,
) -> i32;

/// A node of a thread's exception handler chain.
///
/// Layout-compatible with `EXCEPTION_REGISTRATION_RECORD`. Records are never heap
/// allocated: a record is a local of the frame it guards, which is what gives the
/// chain its ordering by stack address. Frames that need more state than the handler
/// pointer embed the record as the first field of a larger `#[repr(C)]` structure and
/// recover it from the establisher frame pointer.
///
/// # Example
///
/// ```rust
/// use sehveh::{chain::{ExceptionChain, LocalChain, RegistrationRecord}, Context, ExceptionRecord};
///
/// unsafe extern "system" fn handler(
///     _: *mut ExceptionRecord,
///     _: *mut RegistrationRecord,
///     _: *mut Context,
///     _: *mut *mut RegistrationRecord,
/// ) -> i32 {
///     1 // ContinueSearch
/// }
///
/// let chain = LocalChain::around_current(1 << 20);
/// let mut record = RegistrationRecord::new(handler);
///
/// unsafe { record.link(&chain) };
/// assert_eq!(chain.head(), &mut record as *mut RegistrationRecord);
///
/// unsafe { record.unlink(&chain) };
/// assert!(chain.is_empty());
/// ```
#[repr(C)]
#[derive(Debug)]
pub struct RegistrationRecord {
    /// The next older record, or [`CHAIN_END`].
    pub next: *mut RegistrationRecord,
    /// The routine invoked for exceptions and unwinds passing this frame.
    pub handler: ExceptionRoutine,
}

impl RegistrationRecord {
    /// Creates an unlinked record for `handler`.
    #[must_use]
    pub fn new(handler: ExceptionRoutine) -> Self {
        Self {
            next: CHAIN_END,
            handler,
        }
    }

    /// Pushes this record onto `chain`.
    ///
    /// # Safety
    ///
    /// The record must live on the current thread's stack, must be newer than every
    /// record already on the chain, and must be unlinked before its frame is left.
    pub unsafe fn link<C: ExceptionChain + ?Sized>(&mut self, chain: &C) {
        self.next = chain.head();
        chain.set_head(self);
    }

    /// Restores the chain head this record replaced.
    ///
    /// This bypasses the handlers of any records linked after this one; to notify them,
    /// unwind to [`next`](Self::next) instead.
    ///
    /// # Safety
    ///
    /// The record must have been linked onto `chain` with [`link`](Self::link).
    pub unsafe fn unlink<C: ExceptionChain + ?Sized>(&mut self, chain: &C) {
        chain.set_head(self.next);
    }
}

/// The extent of a thread's stack.
///
/// `low` is the lowest usable address, `high` is one past the highest. Registration
/// records are validated against these limits before their handler is trusted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackLimits {
    /// Lowest address of the stack
    pub low: usize,
    /// One past the highest address of the stack
    pub high: usize,
}

impl StackLimits {
    /// Creates limits covering `[low, high)`.
    #[must_use]
    pub fn new(low: usize, high: usize) -> Self {
        Self { low, high }
    }

    /// Whether `record` lies completely within the limits and is properly aligned.
    #[must_use]
    pub fn contains_record(&self, record: *const RegistrationRecord) -> bool {
        let address = record as usize;
        let alignment = mem::align_of::<RegistrationRecord>();

        address >= self.low
            && address
                .checked_add(mem::size_of::<RegistrationRecord>())
                .is_some_and(|end| end <= self.high)
            && address & (alignment - 1) == 0
    }
}

/// Access to the running thread's registration chain.
///
/// This is the only place the hardware/ABI defined head slot is touched; dispatch,
/// unwind and the handler trampoline all go through it. Implementations carry no
/// locking because the slot belongs exclusively to the thread reading it.
pub trait ExceptionChain {
    /// The newest record on the current thread's chain, or [`CHAIN_END`].
    fn head(&self) -> *mut RegistrationRecord;

    /// Replaces the current thread's chain head.
    ///
    /// # Safety
    ///
    /// `head` must be [`CHAIN_END`] or a valid record on the current thread's stack
    /// whose `next` links form a valid chain.
    unsafe fn set_head(&self, head: *mut RegistrationRecord);

    /// The stack extent of the current thread.
    fn stack_limits(&self) -> StackLimits;

    /// Discards the newest record, advancing the head to its successor.
    ///
    /// An empty chain is left untouched.
    ///
    /// # Safety
    ///
    /// The head must be a valid record.
    unsafe fn pop_head(&self) {
        let head = self.head();
        if head != CHAIN_END && !head.is_null() {
            self.set_head((*head).next);
        }
    }

    /// Whether the current thread has no records registered.
    fn is_empty(&self) -> bool {
        self.head() == CHAIN_END
    }

    /// Collects the records currently on the chain, newest first.
    ///
    /// Walks at most `limit` records so that a corrupted (cyclic) chain can not hang
    /// the caller. Records outside the stack limits end the walk.
    fn records(&self, limit: usize) -> Vec<*mut RegistrationRecord> {
        let limits = self.stack_limits();
        let mut records = Vec::new();
        let mut record = self.head();

        while record != CHAIN_END && records.len() < limit && limits.contains_record(record) {
            records.push(record);
            // SAFETY: the record was validated against the stack limits above.
            record = unsafe { (*record).next };
        }

        records
    }
}

impl<C: ExceptionChain + ?Sized> ExceptionChain for &C {
    fn head(&self) -> *mut RegistrationRecord {
        (**self).head()
    }

    unsafe fn set_head(&self, head: *mut RegistrationRecord) {
        (**self).set_head(head);
    }

    fn stack_limits(&self) -> StackLimits {
        (**self).stack_limits()
    }
}

/// Address of a record as an integer, for logging and ordering.
pub(crate) fn address_of(record: *const RegistrationRecord) -> usize {
    record as usize
}
