use std::{mem, ptr, sync::Mutex};

use log::{debug, warn};
use windows_sys::Win32::System::{
    Diagnostics::Debug::{
        AddVectoredExceptionHandler, AddrModeFlat, RemoveVectoredExceptionHandler, StackWalk64,
        EXCEPTION_CONTINUE_EXECUTION, EXCEPTION_CONTINUE_SEARCH, EXCEPTION_POINTERS,
        STACKFRAME64,
    },
    Threading::{GetCurrentProcess, GetCurrentThread},
};

use crate::{
    filter::{StackTracer, ThrowSignature},
    record::{Context, ExceptionFlags},
    status::STATUS_CALIBRATION_PROBE,
    Error, Result,
};

const IMAGE_FILE_MACHINE_I386: u32 = 0x014C;

/// Deep enough for any realistic throw path.
const MAX_FRAMES: usize = 256;

/// DbgHelp is single threaded.
static STACK_WALK: Mutex<()> = Mutex::new(());

/// The result of the calibration probe, handed from the probe handler to `calibrate`.
static CALIBRATION: Mutex<Option<Result<ThrowSignature>>> = Mutex::new(None);

/// Walks EBP frames with DbgHelp's `StackWalk64`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DbgHelpTracer;

impl StackTracer for DbgHelpTracer {
    fn capture(&self, context: &Context) -> Result<Vec<usize>> {
        // StackWalk64 updates the context as it goes.
        let mut context = *context;

        // SAFETY: STACKFRAME64 is plain data; all-zero is its documented initial state.
        let mut frame: STACKFRAME64 = unsafe { mem::zeroed() };
        frame.AddrPC.Offset = u64::from(context.eip);
        frame.AddrPC.Mode = AddrModeFlat;
        frame.AddrFrame.Offset = u64::from(context.ebp);
        frame.AddrFrame.Mode = AddrModeFlat;
        frame.AddrStack.Offset = u64::from(context.esp);
        frame.AddrStack.Mode = AddrModeFlat;

        let mut trace = Vec::new();
        let _walk = lock!(STACK_WALK);

        // SAFETY: pseudo handles of the current process and thread never need closing.
        let (process, thread) = unsafe { (GetCurrentProcess(), GetCurrentThread()) };
        while trace.len() < MAX_FRAMES
            && unsafe {
                StackWalk64(
                    IMAGE_FILE_MACHINE_I386,
                    process,
                    thread,
                    &mut frame,
                    ptr::addr_of_mut!(context).cast(),
                    None,
                    None,
                    None,
                    None,
                )
            } != 0
        {
            if frame.AddrPC.Offset == 0 {
                break;
            }
            trace.push(frame.AddrPC.Offset as usize);
        }

        Ok(trace)
    }
}

/// Records the throw path of the calibration probe and resumes after it.
unsafe extern "system" fn calibration_probe(info: *mut EXCEPTION_POINTERS) -> i32 {
    if (*(*info).ExceptionRecord).ExceptionCode as u32 != STATUS_CALIBRATION_PROBE {
        return EXCEPTION_CONTINUE_SEARCH;
    }

    let context = &*(*info).ContextRecord.cast::<Context>();
    let signature = DbgHelpTracer
        .capture(context)
        .and_then(|trace| ThrowSignature::from_trace(&trace));

    *lock!(CALIBRATION) = Some(signature);
    EXCEPTION_CONTINUE_EXECUTION
}

/// Learns the return addresses of the throw path by raising a probe through
/// [`super::raise`].
#[cfg_attr(not(feature = "origin-check"), allow(dead_code))]
pub(super) fn calibrate() -> Result<ThrowSignature> {
    // SAFETY: the probe only inspects the exception and resumes it.
    let probe = unsafe { AddVectoredExceptionHandler(1, Some(calibration_probe)) };
    if probe.is_null() {
        return Err(Error::InstallFailed);
    }

    lock!(CALIBRATION).take();
    // SAFETY: the probe is the first vectored handler and continues the exception.
    unsafe { super::raise(STATUS_CALIBRATION_PROBE, ExceptionFlags::empty(), &[]) };
    unsafe { RemoveVectoredExceptionHandler(probe) };

    match lock!(CALIBRATION).take() {
        Some(Ok(signature)) => {
            debug!(
                "Calibrated throw path, raise site {:#x}, throw site {:#x}",
                signature.raise_site, signature.throw_site
            );
            Ok(signature)
        }
        Some(Err(error)) => {
            warn!("Throw path calibration failed - {error}");
            Err(error)
        }
        None => Err(Error::TraceCapture(0)),
    }
}
