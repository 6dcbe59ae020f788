//! Shared fixtures for the chain walking tests.
//!
//! Frames are kept in arrays so that their addresses ascend with the index, exactly
//! like records on a real stack: index 0 is the newest record and the chain head.

#![allow(dead_code)]

use std::{cell::RefCell, ptr};

use sehveh::{
    chain::{ExceptionRoutine, LocalChain, RegistrationRecord, CHAIN_END},
    Context, ExceptionFlags, ExceptionRecord,
};

/// Generous enough to cover every frame between a test body and its handlers.
pub const SPAN: usize = 1 << 20;

/// A registration record with the state its handler needs.
#[repr(C)]
pub struct TestFrame {
    pub record: RegistrationRecord,
    pub id: u32,
    pub answer: i32,
    pub peer: *mut RegistrationRecord,
}

impl TestFrame {
    pub fn new(id: u32, answer: i32) -> Self {
        Self::with_handler(id, answer, answering)
    }

    pub fn with_handler(
        id: u32,
        answer: i32,
        handler: ExceptionRoutine,
    ) -> Self {
        Self {
            record: RegistrationRecord::new(handler),
            id,
            answer,
            peer: ptr::null_mut(),
        }
    }

    pub fn as_record(&mut self) -> *mut RegistrationRecord {
        ptr::addr_of_mut!(self.record)
    }
}

/// Links `frames` so that the first one becomes the head.
pub fn link_all(chain: &LocalChain, frames: &mut [TestFrame]) {
    for frame in frames.iter_mut().rev() {
        unsafe { frame.record.link(chain) };
    }
}

/// A chain accessor around the caller, starting out empty.
pub fn fresh_chain() -> LocalChain {
    let chain = LocalChain::around_current(SPAN);
    chain.reset();
    chain
}

/// A record that lives in static memory, far away from any thread stack.
pub struct Outside(pub RegistrationRecord);

unsafe impl Sync for Outside {}

pub static OUTSIDE: Outside = Outside(RegistrationRecord {
    next: CHAIN_END,
    handler: must_not_run,
});

pub fn outside_record() -> *mut RegistrationRecord {
    ptr::addr_of!(OUTSIDE.0).cast_mut()
}

thread_local! {
    static CALLS: RefCell<Vec<(u32, ExceptionFlags)>> = const { RefCell::new(Vec::new()) };
}

pub fn record_call(id: u32, flags: ExceptionFlags) {
    CALLS.with(|calls| calls.borrow_mut().push((id, flags)));
}

/// Every handler call on this thread since the last `take_calls`.
pub fn take_calls() -> Vec<(u32, ExceptionFlags)> {
    CALLS.with(|calls| calls.borrow_mut().drain(..).collect())
}

pub fn call_ids(calls: &[(u32, ExceptionFlags)]) -> Vec<u32> {
    calls.iter().map(|(id, _)| *id).collect()
}

/// The frame owning `record`.
///
/// # Safety
///
/// `record` must be the first field of a live `TestFrame`.
pub unsafe fn frame_of<'a>(record: *mut RegistrationRecord) -> &'a TestFrame {
    &*record.cast::<TestFrame>()
}

/// Logs the call and returns the frame's configured answer.
pub unsafe extern "system" fn answering(
    exception: *mut ExceptionRecord,
    establisher_frame: *mut RegistrationRecord,
    _context: *mut Context,
    _dispatcher_context: *mut *mut RegistrationRecord,
) -> i32 {
    let frame = frame_of(establisher_frame);
    record_call(frame.id, (*exception).flags);
    frame.answer
}

pub unsafe extern "system" fn must_not_run(
    exception: *mut ExceptionRecord,
    _establisher_frame: *mut RegistrationRecord,
    _context: *mut Context,
    _dispatcher_context: *mut *mut RegistrationRecord,
) -> i32 {
    record_call(u32::MAX, (*exception).flags);
    1
}
