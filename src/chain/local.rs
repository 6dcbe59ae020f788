use std::{cell::Cell, ptr};

use crate::chain::{ExceptionChain, RegistrationRecord, StackLimits, CHAIN_END};

thread_local! {
    static HEAD: Cell<*mut RegistrationRecord> = const { Cell::new(CHAIN_END) };
}

/// A registration chain rooted in a thread-local slot.
///
/// Behaves exactly like the native chain, including being strictly per-thread: every
/// `LocalChain` on a thread shares that thread's single head, and a fresh thread starts
/// with an empty chain. Only the stack limits are per instance, since a host without a
/// native chain has no portable way to ask for them.
///
/// This is what lets dispatch and unwind run off Windows, and it is what the test suite
/// and the benchmarks drive.
#[derive(Clone, Copy, Debug)]
pub struct LocalChain {
    limits: StackLimits,
}

impl LocalChain {
    /// Creates a chain accessor that validates records against `limits`.
    #[must_use]
    pub fn new(limits: StackLimits) -> Self {
        Self { limits }
    }

    /// Creates a chain accessor whose limits extend `span` bytes to either side of the
    /// caller's stack position.
    ///
    /// Records in the caller's own frame and in the frames above and below it are
    /// accepted as long as they are within `span` bytes.
    #[inline(never)]
    #[must_use]
    pub fn around_current(span: usize) -> Self {
        let marker = 0u8;
        let position = ptr::addr_of!(marker) as usize;

        Self::new(StackLimits::new(
            position.saturating_sub(span),
            position.saturating_add(span),
        ))
    }

    /// Empties the current thread's chain.
    ///
    /// Records still linked are forgotten without their handlers being called.
    pub fn reset(&self) {
        HEAD.with(|head| head.set(CHAIN_END));
    }
}

impl ExceptionChain for LocalChain {
    fn head(&self) -> *mut RegistrationRecord {
        HEAD.with(Cell::get)
    }

    unsafe fn set_head(&self, head: *mut RegistrationRecord) {
        HEAD.with(|slot| slot.set(head));
    }

    fn stack_limits(&self) -> StackLimits {
        self.limits
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::record::{Context, ExceptionRecord};

    unsafe extern "system" fn ignore(
        _: *mut ExceptionRecord,
        _: *mut RegistrationRecord,
        _: *mut Context,
        _: *mut *mut RegistrationRecord,
    ) -> i32 {
        1
    }

    #[test]
    fn starts_empty() {
        let chain = LocalChain::around_current(4096);
        assert_eq!(chain.head(), CHAIN_END);
        assert!(chain.is_empty());
    }

    #[test]
    fn around_current_covers_locals() {
        let chain = LocalChain::around_current(1 << 16);
        let record = RegistrationRecord::new(ignore);
        assert!(chain.stack_limits().contains_record(&record));
    }

    #[test]
    fn head_is_per_thread() {
        let chain = LocalChain::around_current(1 << 16);
        let mut record = RegistrationRecord::new(ignore);
        unsafe { record.link(&chain) };

        let other = thread::spawn(|| LocalChain::around_current(4096).is_empty())
            .join()
            .unwrap();
        assert!(other);
        assert_eq!(chain.head(), &mut record as *mut RegistrationRecord);

        chain.reset();
        assert!(chain.is_empty());
    }
}
