//! Build-time selection of the dispatch filter.
//!
//! The policy the Windows backend runs is chosen with cargo features:
//!
//! | Feature              | Policy                              |
//! |----------------------|-------------------------------------|
//! | *(none)*             | [`crate::filter::NoCheck`]          |
//! | `origin-check`       | [`crate::filter::OriginFilter`]     |
//! | `safe-handler-check` | [`crate::filter::SafeHandlerFilter`] |
//!
//! The two checking features are mutually exclusive.

use strum::{Display, EnumString};

#[cfg(all(feature = "origin-check", feature = "safe-handler-check"))]
compile_error!("features `origin-check` and `safe-handler-check` are mutually exclusive");

/// The available dispatch filter policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum Checking {
    /// Every exception is dispatched.
    Off,
    /// Exceptions originating outside this module are left to the OS.
    Origin,
    /// Exceptions whose top handler passes SafeSEH validation are left to the OS.
    SafeHandler,
}

/// The policy this build was compiled with.
pub const CHECKING: Checking = if cfg!(feature = "origin-check") {
    Checking::Origin
} else if cfg!(feature = "safe-handler-check") {
    Checking::SafeHandler
} else {
    Checking::Off
};

/// The filter type the Windows backend instantiates.
#[cfg(all(
    windows,
    target_arch = "x86",
    not(feature = "origin-check"),
    not(feature = "safe-handler-check")
))]
pub type ActiveFilter = crate::filter::NoCheck;

/// The filter type the Windows backend instantiates.
#[cfg(all(windows, target_arch = "x86", feature = "origin-check"))]
pub type ActiveFilter = crate::filter::OriginFilter<crate::windows::DbgHelpTracer>;

/// The filter type the Windows backend instantiates.
#[cfg(all(windows, target_arch = "x86", feature = "safe-handler-check"))]
pub type ActiveFilter = crate::filter::SafeHandlerFilter<crate::windows::LoadedModules>;
