//! Origin heuristic.
//!
//! The faulting instruction of a software exception is always inside the raise
//! machinery (`RaiseException`, or a language runtime's throw helper calling it), never
//! in the code that actually threw. To attribute such a fault to a module, the
//! [`OriginFilter`] walks the stack from the fault context, skips the return addresses
//! that belong to the throw indirection, and checks whether the first remaining address
//! lies inside the protected module.
//!
//! Which return addresses make up the indirection is learned once, by raising a probe
//! exception through the same path and recording the first two frames of its trace (a
//! [`ThrowSignature`]). This only holds while the indirection is stable and keeps frame
//! pointers. It is a best-effort heuristic.

use log::trace;

use crate::{
    chain::ExceptionChain,
    filter::DispatchFilter,
    record::{Context, ExceptionRecord},
    Error::{OriginUnresolved, TraceCapture},
    Result,
};

/// Captures return addresses starting at a register context.
pub trait StackTracer {
    /// The program counters of the frames above `context`, innermost first.
    ///
    /// # Errors
    ///
    /// Returns an error if the walk can not be performed at all.
    fn capture(&self, context: &Context) -> Result<Vec<usize>>;
}

/// The return addresses a thrown exception's trace starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrowSignature {
    /// Return address inside the raise primitive
    pub raise_site: usize,
    /// Return address inside the helper that calls the raise primitive
    pub throw_site: usize,
}

impl ThrowSignature {
    /// Takes the signature from the trace of a calibration probe.
    ///
    /// # Errors
    ///
    /// Returns [`TraceCapture`] with the frame count if fewer than two frames were
    /// captured.
    pub fn from_trace(trace: &[usize]) -> Result<Self> {
        match trace {
            [raise_site, throw_site, ..] => Ok(Self {
                raise_site: *raise_site,
                throw_site: *throw_site,
            }),
            _ => Err(TraceCapture(trace.len())),
        }
    }
}

/// The address range of a loaded module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleRange {
    /// Address the module is mapped at
    pub base: usize,
    /// `SizeOfImage` of the module
    pub size: usize,
}

impl ModuleRange {
    /// Whether `address` lies strictly between the start and the end of the module.
    ///
    /// Neither the image base (the DOS header) nor the end of the image can be a
    /// return address, so both bounds are exclusive.
    #[must_use]
    pub fn contains(&self, address: usize) -> bool {
        address > self.base && address < self.base.saturating_add(self.size)
    }
}

/// Decides whether the exception that produced `trace` originated inside `module`.
///
/// A leading raise site is skipped, then a throw site, and the next address decides.
///
/// # Errors
///
/// Returns [`OriginUnresolved`] if the trace is empty or consists of nothing but the
/// throw indirection.
pub fn classify(trace: &[usize], signature: &ThrowSignature, module: &ModuleRange) -> Result<bool> {
    let mut index = 0;
    if trace.get(index) == Some(&signature.raise_site) {
        index += 1;
    }
    if trace.get(index) == Some(&signature.throw_site) {
        index += 1;
    }

    trace
        .get(index)
        .map(|&origin| module.contains(origin))
        .ok_or(OriginUnresolved)
}

/// Defers to the OS when a fault originated outside the protected module.
#[derive(Debug, Clone)]
pub struct OriginFilter<T> {
    tracer: T,
    signature: ThrowSignature,
    module: ModuleRange,
}

impl<T: StackTracer> OriginFilter<T> {
    /// Creates a filter for `module` using a calibrated `signature`.
    pub fn new(tracer: T, signature: ThrowSignature, module: ModuleRange) -> Self {
        Self {
            tracer,
            signature,
            module,
        }
    }

    /// The throw signature in use.
    pub fn signature(&self) -> &ThrowSignature {
        &self.signature
    }

    /// The protected module.
    pub fn module(&self) -> &ModuleRange {
        &self.module
    }
}

impl<T: StackTracer> DispatchFilter for OriginFilter<T> {
    fn should_defer<C: ExceptionChain + ?Sized>(
        &self,
        _chain: &C,
        exception: &ExceptionRecord,
        context: &Context,
    ) -> Result<bool> {
        let trace = self.tracer.capture(context)?;
        let inside = classify(&trace, &self.signature, &self.module)?;

        if !inside {
            trace!(
                "Exception {:#x} originated outside {:#x}..{:#x}, deferring",
                exception.code,
                self.module.base,
                self.module.base.saturating_add(self.module.size)
            );
        }
        Ok(!inside)
    }
}
