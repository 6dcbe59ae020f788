//! Integration tests for the first-pass dispatch.
//!
//! Chains are built from stack frames on the test thread and walked with the
//! thread-local chain, so every scenario runs on any host.

mod common;

use std::cell::Cell;

use common::*;
use sehveh::{
    chain::{ExceptionChain, LocalChain, RegistrationRecord},
    filter::DispatchFilter,
    status::{STATUS_ACCESS_VIOLATION, STATUS_INTEGER_DIVIDE_BY_ZERO},
    Context, DispatchOutcome, Dispatcher, Error, ExceptionFlags, ExceptionRecord, Result,
};

fn divide_by_zero() -> ExceptionRecord {
    ExceptionRecord::new(STATUS_INTEGER_DIVIDE_BY_ZERO, ExceptionFlags::empty())
}

#[test]
fn unresolved_exception_visits_every_record() {
    let chain = fresh_chain();
    let mut frames = [TestFrame::new(0, 1), TestFrame::new(1, 1), TestFrame::new(2, 1)];
    link_all(&chain, &mut frames);

    let mut exception = divide_by_zero();
    let mut context = Context::default();
    let outcome = unsafe { Dispatcher::new(chain).dispatch(&mut exception, &mut context) };

    assert!(matches!(outcome, DispatchOutcome::Unhandled));
    let calls = take_calls();
    assert_eq!(call_ids(&calls), vec![0, 1, 2]);
    assert!(calls.iter().all(|(_, flags)| flags.is_empty()));
    assert!(!exception.flags.contains(ExceptionFlags::STACK_INVALID));

    // Dispatch never changes the chain.
    assert_eq!(chain.head(), frames[0].as_record());
    assert_eq!(chain.records(8).len(), 3);
}

#[test]
fn empty_chain_is_unhandled() {
    let chain = fresh_chain();
    let mut exception = divide_by_zero();
    let mut context = Context::default();

    let outcome = unsafe { Dispatcher::new(chain).dispatch(&mut exception, &mut context) };

    assert!(matches!(outcome, DispatchOutcome::Unhandled));
    assert!(take_calls().is_empty());
}

unsafe extern "system" fn skip_instruction(
    exception: *mut ExceptionRecord,
    establisher_frame: *mut RegistrationRecord,
    context: *mut Context,
    _dispatcher_context: *mut *mut RegistrationRecord,
) -> i32 {
    record_call(frame_of(establisher_frame).id, (*exception).flags);
    (*context).eip += 2;
    (*context).eax = 0xDEAD;
    0
}

#[test]
fn continue_execution_stops_the_search() {
    let chain = fresh_chain();
    let mut frames = [
        TestFrame::new(0, 1),
        TestFrame::with_handler(1, 0, skip_instruction),
        TestFrame::new(2, 1),
    ];
    link_all(&chain, &mut frames);

    let mut exception = divide_by_zero();
    let mut context = Context {
        eip: 0x0040_1000,
        ..Context::default()
    };
    let outcome = unsafe { Dispatcher::new(chain).dispatch(&mut exception, &mut context) };

    assert!(matches!(outcome, DispatchOutcome::ContinueExecution));
    assert_eq!(call_ids(&take_calls()), vec![0, 1]);
    assert_eq!(context.eip, 0x0040_1002);
    assert_eq!(context.eax, 0xDEAD);
}

#[test]
fn noncontinuable_exception_can_not_be_continued() {
    let chain = fresh_chain();
    let mut frames = [TestFrame::new(0, 0), TestFrame::new(1, 1)];
    link_all(&chain, &mut frames);

    let mut exception = ExceptionRecord::new(
        STATUS_INTEGER_DIVIDE_BY_ZERO,
        ExceptionFlags::NONCONTINUABLE,
    );
    let mut context = Context::default();
    let outcome = unsafe { Dispatcher::new(chain).dispatch(&mut exception, &mut context) };

    match outcome {
        DispatchOutcome::Fatal(error) => {
            assert!(matches!(error, Error::NoncontinuableContinued));
            assert!(error.first_chance());
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(call_ids(&take_calls()), vec![0]);
}

#[test]
fn unknown_disposition_is_fatal() {
    for answer in [3, 7, -1] {
        let chain = fresh_chain();
        let mut frames = [TestFrame::new(0, answer), TestFrame::new(1, 1)];
        link_all(&chain, &mut frames);

        let mut exception = divide_by_zero();
        let mut context = Context::default();
        let outcome = unsafe { Dispatcher::new(chain).dispatch(&mut exception, &mut context) };

        match outcome {
            DispatchOutcome::Fatal(Error::InvalidDisposition(raw)) => assert_eq!(raw, answer),
            other => panic!("unexpected outcome {other:?} for {answer}"),
        }
        assert_eq!(call_ids(&take_calls()), vec![0]);
    }
}

#[test]
fn record_outside_the_stack_ends_the_search() {
    let chain = fresh_chain();
    let mut frames = [TestFrame::new(0, 1), TestFrame::new(1, 1)];
    link_all(&chain, &mut frames);
    frames[0].record.next = outside_record();

    let mut exception = divide_by_zero();
    let mut context = Context::default();
    let outcome = unsafe { Dispatcher::new(chain).dispatch(&mut exception, &mut context) };

    assert!(matches!(outcome, DispatchOutcome::Unhandled));
    assert!(exception.flags.contains(ExceptionFlags::STACK_INVALID));
    // The corrupt record and everything behind it are never called.
    assert_eq!(call_ids(&take_calls()), vec![0]);
}

#[test]
fn misaligned_record_ends_the_search() {
    let chain = fresh_chain();
    let storage = [0usize; 8];
    let misaligned = storage.as_ptr().cast::<u8>().wrapping_add(1) as *mut RegistrationRecord;

    let mut frames = [TestFrame::new(0, 1)];
    link_all(&chain, &mut frames);
    frames[0].record.next = misaligned;

    let mut exception = divide_by_zero();
    let mut context = Context::default();
    let outcome = unsafe { Dispatcher::new(chain).dispatch(&mut exception, &mut context) };

    assert!(matches!(outcome, DispatchOutcome::Unhandled));
    assert!(exception.flags.contains(ExceptionFlags::STACK_INVALID));
    assert_eq!(call_ids(&take_calls()), vec![0]);
}

#[test]
fn corrupt_head_is_reported_without_calls() {
    let chain = fresh_chain();
    unsafe { chain.set_head(outside_record()) };

    let mut exception = divide_by_zero();
    let mut context = Context::default();
    let outcome = unsafe { Dispatcher::new(chain).dispatch(&mut exception, &mut context) };

    assert!(matches!(outcome, DispatchOutcome::Unhandled));
    assert!(exception.flags.contains(ExceptionFlags::STACK_INVALID));
    assert!(take_calls().is_empty());
    chain.reset();
}

thread_local! {
    static FAULTED: Cell<bool> = const { Cell::new(false) };
    static INNER: Cell<Option<(bool, ExceptionFlags)>> = const { Cell::new(None) };
}

/// Dispatches a second exception the first time it is called.
unsafe extern "system" fn fault_while_handling(
    exception: *mut ExceptionRecord,
    establisher_frame: *mut RegistrationRecord,
    _context: *mut Context,
    _dispatcher_context: *mut *mut RegistrationRecord,
) -> i32 {
    record_call(frame_of(establisher_frame).id, (*exception).flags);

    if !FAULTED.replace(true) {
        let mut secondary = ExceptionRecord::new(STATUS_ACCESS_VIOLATION, ExceptionFlags::empty());
        let mut context = Context::default();
        let outcome = Dispatcher::new(LocalChain::around_current(SPAN))
            .dispatch(&mut secondary, &mut context);

        INNER.set(Some((
            matches!(outcome, DispatchOutcome::Unhandled),
            secondary.flags,
        )));
    }

    1
}

#[test]
fn nested_exception_is_marked_up_to_the_busy_frame() {
    let chain = fresh_chain();
    let mut frames = [
        TestFrame::new(0, 1),
        TestFrame::with_handler(1, 1, fault_while_handling),
        TestFrame::new(2, 1),
    ];
    link_all(&chain, &mut frames);

    let mut exception = divide_by_zero();
    let mut context = Context::default();
    let outcome = unsafe { Dispatcher::new(chain).dispatch(&mut exception, &mut context) };

    assert!(matches!(outcome, DispatchOutcome::Unhandled));
    assert_eq!(
        take_calls(),
        vec![
            // outer pass
            (0, ExceptionFlags::empty()),
            (1, ExceptionFlags::empty()),
            // inner pass, behind the guard of frame 1
            (0, ExceptionFlags::NESTED_CALL),
            (1, ExceptionFlags::NESTED_CALL),
            (2, ExceptionFlags::empty()),
            // outer pass resumes
            (2, ExceptionFlags::empty()),
        ]
    );

    let (unhandled, flags) = INNER.get().expect("inner dispatch ran");
    assert!(unhandled);
    assert!(!flags.contains(ExceptionFlags::NESTED_CALL));
    assert!(exception.flags.is_empty());

    // Guards are gone once the handlers return.
    assert_eq!(chain.head(), frames[0].as_record());
}

thread_local! {
    static OUTER_FAULTED: Cell<bool> = const { Cell::new(false) };
    static INNER_FAULTED: Cell<bool> = const { Cell::new(false) };
    static INNERMOST: Cell<Option<ExceptionFlags>> = const { Cell::new(None) };
}

/// Starts a second pass the first time it is called outside of a nested pass.
unsafe extern "system" fn fault_in_outer_pass(
    exception: *mut ExceptionRecord,
    establisher_frame: *mut RegistrationRecord,
    _context: *mut Context,
    _dispatcher_context: *mut *mut RegistrationRecord,
) -> i32 {
    record_call(frame_of(establisher_frame).id, (*exception).flags);

    if !(*exception).flags.contains(ExceptionFlags::NESTED_CALL)
        && !OUTER_FAULTED.replace(true)
    {
        let mut secondary = ExceptionRecord::new(STATUS_ACCESS_VIOLATION, ExceptionFlags::empty());
        let mut context = Context::default();
        Dispatcher::new(LocalChain::around_current(SPAN)).dispatch(&mut secondary, &mut context);
    }

    1
}

/// Starts a third pass the first time it is called from inside a nested pass.
unsafe extern "system" fn fault_in_nested_pass(
    exception: *mut ExceptionRecord,
    establisher_frame: *mut RegistrationRecord,
    _context: *mut Context,
    _dispatcher_context: *mut *mut RegistrationRecord,
) -> i32 {
    record_call(frame_of(establisher_frame).id, (*exception).flags);

    if (*exception).flags.contains(ExceptionFlags::NESTED_CALL) && !INNER_FAULTED.replace(true) {
        let mut tertiary = ExceptionRecord::new(STATUS_ACCESS_VIOLATION, ExceptionFlags::empty());
        let mut context = Context::default();
        Dispatcher::new(LocalChain::around_current(SPAN)).dispatch(&mut tertiary, &mut context);
        INNERMOST.set(Some(tertiary.flags));
    }

    1
}

#[test]
fn nested_marker_keeps_the_oldest_busy_frame() {
    let chain = fresh_chain();
    let mut frames = [
        TestFrame::with_handler(0, 1, fault_in_nested_pass),
        TestFrame::with_handler(1, 1, fault_in_outer_pass),
        TestFrame::new(2, 1),
    ];
    link_all(&chain, &mut frames);

    let mut exception = divide_by_zero();
    let mut context = Context::default();
    let outcome = unsafe { Dispatcher::new(chain).dispatch(&mut exception, &mut context) };

    assert!(matches!(outcome, DispatchOutcome::Unhandled));

    // The innermost pass first meets the guard of frame 0, then the older guard of
    // frame 1, and must keep marking until frame 1 has been called.
    let nested = ExceptionFlags::NESTED_CALL;
    let empty = ExceptionFlags::empty();
    assert_eq!(
        take_calls(),
        vec![
            // outer pass
            (0, empty),
            (1, empty),
            // second pass, behind the guard of frame 1
            (0, nested),
            // innermost pass, behind the guards of frames 0 and 1
            (0, nested),
            (1, nested),
            (2, empty),
            // second pass resumes
            (1, nested),
            (2, empty),
            // outer pass resumes
            (2, empty),
        ]
    );

    let flags = INNERMOST.get().expect("innermost dispatch ran");
    assert!(!flags.contains(ExceptionFlags::NESTED_CALL));
    assert_eq!(chain.head(), frames[0].as_record());
}

struct DeferAll;

impl DispatchFilter for DeferAll {
    fn should_defer<C: ExceptionChain + ?Sized>(
        &self,
        _chain: &C,
        _exception: &ExceptionRecord,
        _context: &Context,
    ) -> Result<bool> {
        Ok(true)
    }
}

struct Undecided;

impl DispatchFilter for Undecided {
    fn should_defer<C: ExceptionChain + ?Sized>(
        &self,
        _chain: &C,
        _exception: &ExceptionRecord,
        _context: &Context,
    ) -> Result<bool> {
        Err(Error::OriginUnresolved)
    }
}

#[test]
fn filter_runs_before_any_handler() {
    let chain = fresh_chain();
    let mut frames = [TestFrame::new(0, 0)];
    link_all(&chain, &mut frames);

    let mut exception = divide_by_zero();
    let mut context = Context::default();

    let deferred =
        unsafe { Dispatcher::with_filter(chain, DeferAll).dispatch(&mut exception, &mut context) };
    assert!(matches!(deferred, DispatchOutcome::Defer));

    let failed = unsafe {
        Dispatcher::with_filter(chain, &Undecided).dispatch(&mut exception, &mut context)
    };
    match failed {
        DispatchOutcome::Fatal(error) => assert!(!error.first_chance()),
        other => panic!("unexpected outcome {other:?}"),
    }

    assert!(take_calls().is_empty());
    assert!(exception.flags.is_empty());
}
