//! Policies deciding whether a fault is left to the operating system.
//!
//! Before walking the chain, the dispatcher asks its filter whether the exception is
//! one this library should handle at all. A filter that answers `true` makes the
//! vectored handler step aside, and the OS dispatcher (with its own handler validation)
//! takes over. The policy is a type parameter of [`crate::Dispatcher`], so the choice
//! is made once at build time rather than per fault; see [`crate::config`] for how the
//! Windows backend selects it.
//!
//! # Key Components
//!
//! - [`DispatchFilter`] - The policy interface
//! - [`NoCheck`] - Handle every exception
//! - [`SafeHandlerFilter`] - Defer when the top handler passes SafeSEH validation
//! - [`OriginFilter`] - Defer when the fault originated outside the protected module

mod origin;
mod safeseh;

pub use origin::{classify, ModuleRange, OriginFilter, StackTracer, ThrowSignature};
pub use safeseh::{
    ModuleImage, ModuleResolver, SafeHandlerFilter, SafeHandlerTable,
    IMAGE_DLLCHARACTERISTICS_NO_SEH,
};

use crate::{
    chain::ExceptionChain,
    record::{Context, ExceptionRecord},
    Result,
};

/// A policy consulted once per fault, before any handler runs.
pub trait DispatchFilter {
    /// Whether the exception should be left to the operating system.
    ///
    /// # Arguments
    ///
    /// * `chain` - The chain of the faulting thread
    /// * `exception` - The exception being dispatched
    /// * `context` - The register context at the fault
    ///
    /// # Errors
    ///
    /// Returns an error when the policy can not reach a decision. The dispatcher treats
    /// this as fatal, since guessing would misroute the exception.
    fn should_defer<C: ExceptionChain + ?Sized>(
        &self,
        chain: &C,
        exception: &ExceptionRecord,
        context: &Context,
    ) -> Result<bool>;
}

impl<F: DispatchFilter + ?Sized> DispatchFilter for &F {
    fn should_defer<C: ExceptionChain + ?Sized>(
        &self,
        chain: &C,
        exception: &ExceptionRecord,
        context: &Context,
    ) -> Result<bool> {
        (**self).should_defer(chain, exception, context)
    }
}

/// Handles every exception, never deferring to the OS.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCheck;

impl DispatchFilter for NoCheck {
    fn should_defer<C: ExceptionChain + ?Sized>(
        &self,
        _chain: &C,
        _exception: &ExceptionRecord,
        _context: &Context,
    ) -> Result<bool> {
        Ok(false)
    }
}
