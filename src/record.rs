//! Exception descriptors, register contexts and handler dispositions.
//!
//! The types in this module are `#[repr(C)]` mirrors of the structures the x86 NT
//! exception dispatcher hands to frame-based handlers. Handlers registered on a
//! chain receive raw pointers to them, exactly as they would from the OS, so any
//! handler written against the native `EXCEPTION_RECORD`/`CONTEXT` layout works
//! unchanged.
//!
//! # Key Components
//!
//! - [`ExceptionRecord`] - The exception descriptor, mutated in place while a pass runs
//! - [`ExceptionFlags`] - The flag set describing what kind of pass is running
//! - [`Context`] - The x86 register snapshot used to resume execution
//! - [`Disposition`] - The verdict a handler returns to its invoker

use std::{ffi::c_void, mem, ptr};

use bitflags::bitflags;
use strum::{Display, FromRepr};

use crate::status::STATUS_UNWIND;

/// Maximum number of parameters an exception record carries.
pub const EXCEPTION_MAXIMUM_PARAMETERS: usize = 15;

bitflags! {
    /// Flags of an [`ExceptionRecord`].
    ///
    /// Flags accumulate while a dispatch or unwind pass runs. Handlers inspect them to
    /// tell a first-pass dispatch apart from an unwind and to find out whether they are
    /// being called while another exception is still being handled.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExceptionFlags: u32 {
        /// Execution can not be continued at the faulting instruction.
        const NONCONTINUABLE = 0x01;

        /// The record is being used to unwind frames.
        const UNWINDING = 0x02;

        /// The unwind has no target and exits the chain.
        const EXIT_UNWIND = 0x04;

        /// A registration record was outside the stack or misaligned.
        const STACK_INVALID = 0x08;

        /// The exception was raised while an older frame was still handling another one.
        const NESTED_CALL = 0x10;

        /// Either of the unwind flags.
        const UNWIND = Self::UNWINDING.bits() | Self::EXIT_UNWIND.bits();
    }
}

/// The exception descriptor.
///
/// Layout-compatible with the native `EXCEPTION_RECORD`. A record is created once per
/// exception and mutated in place as dispatch and unwind progress; records chained
/// through [`chained`](Self::chained) describe the exception that was being handled
/// when this one was raised.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ExceptionRecord {
    /// The status code of the exception.
    pub code: u32,
    /// Dispatch and unwind state.
    pub flags: ExceptionFlags,
    /// The exception this one was raised while handling, or null.
    pub chained: *mut ExceptionRecord,
    /// The instruction at which the exception occurred.
    pub address: *mut c_void,
    /// Number of valid entries in [`information`](Self::information).
    pub parameter_count: u32,
    /// Code specific parameters.
    pub information: [usize; EXCEPTION_MAXIMUM_PARAMETERS],
}

impl ExceptionRecord {
    /// Creates a record with the given code and flags and no parameters.
    #[must_use]
    pub fn new(code: u32, flags: ExceptionFlags) -> Self {
        Self {
            code,
            flags,
            chained: ptr::null_mut(),
            address: ptr::null_mut(),
            parameter_count: 0,
            information: [0; EXCEPTION_MAXIMUM_PARAMETERS],
        }
    }

    /// The descriptor an unwind synthesises when the caller supplies none.
    ///
    /// # Arguments
    ///
    /// * `address` - The instruction pointer of the captured continuation
    #[must_use]
    pub fn unwind_request(address: usize) -> Self {
        let mut record = Self::new(STATUS_UNWIND, ExceptionFlags::empty());
        record.address = address as *mut c_void;
        record
    }

    /// A non-continuable record raised while `chained` was being processed.
    #[must_use]
    pub fn secondary(code: u32, chained: *mut ExceptionRecord) -> Self {
        let mut record = Self::new(code, ExceptionFlags::NONCONTINUABLE);
        record.chained = chained;
        record
    }

    /// The parameters carried by the record.
    #[must_use]
    pub fn parameters(&self) -> &[usize] {
        let count = (self.parameter_count as usize).min(EXCEPTION_MAXIMUM_PARAMETERS);
        &self.information[..count]
    }

    /// Whether the record is travelling through an unwind.
    #[must_use]
    pub fn is_unwinding(&self) -> bool {
        self.flags.intersects(ExceptionFlags::UNWIND)
    }

    /// Whether a handler may resume execution for this record.
    #[must_use]
    pub fn is_continuable(&self) -> bool {
        !self.flags.contains(ExceptionFlags::NONCONTINUABLE)
    }
}

/// The x87 floating point save area embedded in [`Context`].
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FloatingSaveArea {
    /// FPU control word
    pub control_word: u32,
    /// FPU status word
    pub status_word: u32,
    /// FPU tag word
    pub tag_word: u32,
    /// Offset of the last faulting FPU instruction
    pub error_offset: u32,
    /// Selector of the last faulting FPU instruction
    pub error_selector: u32,
    /// Offset of the last FPU operand
    pub data_offset: u32,
    /// Selector of the last FPU operand
    pub data_selector: u32,
    /// The eight 80-bit FPU registers
    pub register_area: [u8; 80],
    /// CR0 NPX state
    pub cr0_npx_state: u32,
}

/// Size of the extended register area (FXSAVE image) of an x86 context.
pub const MAXIMUM_SUPPORTED_EXTENSION: usize = 512;

/// A full x86 register snapshot.
///
/// Layout-compatible with the native x86 `CONTEXT` (716 bytes). A context is either the
/// one captured when the fault occurred, or one captured by an unwind as the place
/// to continue once frames have been discarded. Resuming into a context bypasses the
/// normal call/return sequence entirely.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Context {
    /// Which register groups are valid.
    pub context_flags: u32,
    /// Debug register 0
    pub dr0: u32,
    /// Debug register 1
    pub dr1: u32,
    /// Debug register 2
    pub dr2: u32,
    /// Debug register 3
    pub dr3: u32,
    /// Debug status register
    pub dr6: u32,
    /// Debug control register
    pub dr7: u32,
    /// x87 state
    pub float_save: FloatingSaveArea,
    /// GS segment
    pub seg_gs: u32,
    /// FS segment
    pub seg_fs: u32,
    /// ES segment
    pub seg_es: u32,
    /// DS segment
    pub seg_ds: u32,
    /// General purpose register EDI
    pub edi: u32,
    /// General purpose register ESI
    pub esi: u32,
    /// General purpose register EBX
    pub ebx: u32,
    /// General purpose register EDX
    pub edx: u32,
    /// General purpose register ECX
    pub ecx: u32,
    /// Return value register EAX
    pub eax: u32,
    /// Frame pointer
    pub ebp: u32,
    /// Instruction pointer
    pub eip: u32,
    /// CS segment
    pub seg_cs: u32,
    /// Flags register
    pub eflags: u32,
    /// Stack pointer
    pub esp: u32,
    /// SS segment
    pub seg_ss: u32,
    /// FXSAVE image
    pub extended_registers: [u8; MAXIMUM_SUPPORTED_EXTENSION],
}

impl Default for Context {
    fn default() -> Self {
        // SAFETY: every field is a plain integer or an integer array; all-zero is valid.
        unsafe { mem::zeroed() }
    }
}

impl Context {
    /// Size of one stack slot on x86.
    pub const STACK_SLOT: u32 = mem::size_of::<u32>() as u32;

    /// The instruction pointer.
    #[must_use]
    pub fn instruction_pointer(&self) -> usize {
        self.eip as usize
    }

    /// The stack pointer.
    #[must_use]
    pub fn stack_pointer(&self) -> usize {
        self.esp as usize
    }

    /// The frame pointer.
    #[must_use]
    pub fn frame_pointer(&self) -> usize {
        self.ebp as usize
    }

    /// The value held in the return value register.
    #[must_use]
    pub fn result(&self) -> usize {
        self.eax as usize
    }

    /// Installs `value` in the return value register.
    ///
    /// Registers are 32 bits wide; on wider hosts the value is truncated.
    pub fn set_result(&mut self, value: usize) {
        self.eax = value as u32;
    }

    /// Moves the stack pointer past `count` stack-passed arguments.
    ///
    /// Used to turn a context captured inside a `stdcall` function into the context
    /// of its caller after the callee has cleaned up its arguments.
    pub fn pop_arguments(&mut self, count: u32) {
        self.esp = self.esp.wrapping_add(count * Self::STACK_SLOT);
    }
}

/// The outcome a frame-based handler reports to its invoker.
///
/// Handlers return the raw `i32`; use [`Disposition::from_repr`] to decode it. A value
/// outside this set is a protocol violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, Display)]
#[repr(i32)]
pub enum Disposition {
    /// The exception was dealt with, resume at the context.
    ContinueExecution = 0,
    /// Not handled here, try the next record.
    ContinueSearch = 1,
    /// An exception occurred while a handler for an older frame was running.
    NestedException = 2,
    /// An unwind ran into another unwind already in progress.
    CollidedUnwind = 3,
}

impl From<Disposition> for i32 {
    fn from(disposition: Disposition) -> Self {
        disposition as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_layout_matches_native() {
        assert_eq!(mem::size_of::<FloatingSaveArea>(), 112);
        assert_eq!(mem::size_of::<Context>(), 716);
    }

    #[cfg(target_pointer_width = "32")]
    #[test]
    fn record_layout_matches_native() {
        assert_eq!(mem::size_of::<ExceptionRecord>(), 80);
    }

    #[test]
    fn disposition_from_raw() {
        assert_eq!(
            Disposition::from_repr(0),
            Some(Disposition::ContinueExecution)
        );
        assert_eq!(Disposition::from_repr(3), Some(Disposition::CollidedUnwind));
        assert_eq!(Disposition::from_repr(4), None);
        assert_eq!(Disposition::from_repr(-1), None);
        assert_eq!(i32::from(Disposition::NestedException), 2);
    }

    #[test]
    fn unwind_flags() {
        let mut record = ExceptionRecord::new(0xC000_0005, ExceptionFlags::empty());
        assert!(!record.is_unwinding());

        record.flags |= ExceptionFlags::EXIT_UNWIND;
        assert!(record.is_unwinding());
        assert_eq!(ExceptionFlags::UNWIND.bits(), 0x06);
    }

    #[test]
    fn flags_cover_the_x86_set() {
        assert_eq!(ExceptionFlags::all().bits(), 0x1F);

        // Bits only the x64 unwinder assigns pass through untouched.
        let foreign = ExceptionFlags::from_bits_retain(0x60) | ExceptionFlags::UNWINDING;
        assert_eq!(foreign.bits(), 0x62);
        assert!(foreign.contains(ExceptionFlags::UNWINDING));
    }

    #[test]
    fn unwind_request_descriptor() {
        let record = ExceptionRecord::unwind_request(0x0040_1234);
        assert_eq!(record.code, STATUS_UNWIND);
        assert_eq!(record.address as usize, 0x0040_1234);
        assert!(record.flags.is_empty());
        assert!(record.chained.is_null());
    }

    #[test]
    fn parameters_are_clamped() {
        let mut record = ExceptionRecord::new(0xE000_0001, ExceptionFlags::empty());
        record.parameter_count = 2;
        record.information[0] = 7;
        record.information[1] = 9;
        assert_eq!(record.parameters(), &[7, 9]);

        record.parameter_count = 99;
        assert_eq!(record.parameters().len(), EXCEPTION_MAXIMUM_PARAMETERS);
    }

    #[test]
    fn continuation_adjustments() {
        let mut context = Context {
            esp: 0x0019_FF00,
            ..Context::default()
        };
        context.pop_arguments(4);
        context.set_result(0x2A);

        assert_eq!(context.stack_pointer(), 0x0019_FF10);
        assert_eq!(context.result(), 0x2A);
    }
}
