// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(clippy::missing_safety_doc)]

//! # sehveh
//!
//! Structured exception handling for x86 Windows, dispatched and unwound from inside a
//! vectored exception handler.
//!
//! The x86 OS dispatcher only calls a frame-based handler after validating it against
//! the SafeSEH table of the image it lives in. Handlers in generated code, in injected
//! code, or in images linked without a table (but with SafeSEH enforced) are refused
//! and the process dies. `sehveh` installs a vectored handler that runs the whole SEH
//! protocol itself (the dispatch pass, unwinding, nested and collided exceptions) over
//! the same `fs:[0]` registration chain, so such handlers work exactly as they would
//! natively.
//!
//! ## Architecture
//!
//! The algorithms are portable and written against two seams:
//!
//! - [`chain::ExceptionChain`] - access to the current thread's chain head and stack
//!   limits. [`chain::LocalChain`] provides one on any target; `chain::TebChain` is the
//!   native `fs:[0]` chain.
//! - [`DispatchOutcome`]/[`UnwindOutcome`] - terminal states are returned as values.
//!   The Windows backend turns them into `NtContinue`/`NtRaiseException`.
//!
//! On top of these:
//!
//! - [`Dispatcher`] - the first pass, searching the chain for a handler
//! - [`Unwinder`] - discards frames on the way to a target and resumes there
//! - [`handler`] - the trampoline detecting nested exceptions and collided unwinds
//! - [`filter`] - policies that leave some exceptions to the OS
//! - [`Enablement`] - the idempotent install/remove lifecycle
//! - `windows` - the x86 Windows backend (`enable`, `disable`, `unwind`, `raise`)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sehveh::{chain::RegistrationRecord, windows};
//!
//! windows::enable()?;
//!
//! let mut record = RegistrationRecord::new(my_handler);
//! unsafe { record.link(&sehveh::chain::TebChain) };
//! // guarded region
//! unsafe { windows::unwind(record.next, std::ptr::null_mut(), std::ptr::null_mut(), std::ptr::null_mut()) };
//!
//! windows::disable();
//! # Ok::<(), sehveh::Error>(())
//! ```
//!
//! ## Frame pointers
//!
//! `windows::unwind` recovers its continuation from the caller's EBP frame and the
//! `origin-check` policy walks EBP chains. Binaries using the Windows backend must be
//! built with frame pointers, for example in `.cargo/config.toml`:
//!
//! ```toml
//! [target.'cfg(all(windows, target_arch = "x86"))']
//! rustflags = ["-C", "force-frame-pointers=yes"]
//! ```
//!
//! The flag only applies to the package being built, so depending on `sehveh` does not
//! enable it.
//!
//! ## Policies
//!
//! Cargo features select whether every exception is handled (the default), only those
//! originating in this module (`origin-check`), or only those whose top handler the OS
//! would refuse (`safe-handler-check`). See [`config`].
//!
//! ## Logging
//!
//! Diagnostics go through the [`log`] facade. No logger is installed by this crate.
//!
//! ## Testing
//!
//! The portable core is tested on any host against [`chain::LocalChain`]:
//!
//! ```bash
//! cargo test
//! ```
#[macro_use]
pub(crate) mod macros;

#[macro_use]
pub(crate) mod error;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust
/// use sehveh::prelude::*;
///
/// let chain = LocalChain::around_current(1 << 16);
/// assert!(chain.is_empty());
/// ```
pub mod prelude;

/// Exception descriptors, register contexts and dispositions
pub mod record;

/// Exception status codes
pub mod status;

/// The per-thread registration chain
pub mod chain;

/// Handler invocation with nested exception detection
pub mod handler;

/// First-pass dispatch
pub mod dispatch;

/// Frame unwinding
pub mod unwind;

/// Dispatch filter policies
pub mod filter;

/// Install/remove lifecycle of the vectored handler
pub mod enablement;

/// Build-time policy selection
pub mod config;

/// The Windows x86 backend
#[cfg(all(windows, target_arch = "x86"))]
pub mod windows;

/// `sehveh` Result type
///
/// A type alias for `std::result::Result<T, Error>` where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `sehveh` Error type
///
/// Every failure a dispatch pass, an unwind, a filter or the installation can report.
/// See [`Error::status`] for the exception each one is raised as.
pub use error::Error;

pub use dispatch::{DispatchOutcome, Dispatcher};
pub use enablement::{Enablement, HandlerInstaller};
pub use record::{Context, Disposition, ExceptionFlags, ExceptionRecord};
pub use unwind::{UnwindOutcome, UnwindTarget, Unwinder};
