use std::arch::asm;

use windows_sys::Win32::System::Threading::GetCurrentThreadStackLimits;

use crate::chain::{ExceptionChain, RegistrationRecord, StackLimits};

/// The native x86 registration chain.
///
/// The head is the first field of the thread's NT_TIB, addressed through the `fs`
/// segment. Reading and writing it is a single instruction, which is also how compiled
/// `__try` blocks maintain it.
#[derive(Clone, Copy, Debug, Default)]
pub struct TebChain;

impl ExceptionChain for TebChain {
    fn head(&self) -> *mut RegistrationRecord {
        let head: *mut RegistrationRecord;
        // SAFETY: fs:[0] is always mapped on a Windows x86 thread.
        unsafe {
            asm!(
                "mov {}, dword ptr fs:[0]",
                out(reg) head,
                options(nostack, readonly, preserves_flags)
            );
        }
        head
    }

    unsafe fn set_head(&self, head: *mut RegistrationRecord) {
        asm!(
            "mov dword ptr fs:[0], {}",
            in(reg) head,
            options(nostack, preserves_flags)
        );
    }

    fn stack_limits(&self) -> StackLimits {
        let mut low = 0usize;
        let mut high = 0usize;
        // SAFETY: both out pointers refer to live locals.
        unsafe { GetCurrentThreadStackLimits(&mut low, &mut high) };
        StackLimits::new(low, high)
    }
}
