//! # sehveh Prelude
//!
//! The types needed to register handlers and run dispatch and unwind passes.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all sehveh operations
pub use crate::Error;

/// The result type used throughout sehveh
pub use crate::Result;

// ================================================================================================
// Exception Data
// ================================================================================================

/// Exception descriptor, its flags, the register context and handler dispositions
pub use crate::{Context, Disposition, ExceptionFlags, ExceptionRecord};

// ================================================================================================
// Registration Chain
// ================================================================================================

/// Chain access and stack-resident registration records
pub use crate::chain::{
    ExceptionChain, ExceptionRoutine, LocalChain, RegistrationRecord, StackLimits, CHAIN_END,
};

/// The native `fs:[0]` chain
#[cfg(all(windows, target_arch = "x86"))]
pub use crate::chain::TebChain;

// ================================================================================================
// Dispatch and Unwind
// ================================================================================================

/// First-pass dispatch
pub use crate::{DispatchOutcome, Dispatcher};

/// Unwinding
pub use crate::{UnwindOutcome, UnwindTarget, Unwinder};

/// Filter policies
pub use crate::filter::{DispatchFilter, NoCheck};
