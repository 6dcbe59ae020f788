//! The lifecycle of the process-wide vectored handler.
//!
//! Installing the dispatcher is an explicit, idempotent operation on an [`Enablement`]
//! value rather than a hidden global: enabling twice installs once, and disabling when
//! nothing is installed does nothing. `Enablement` itself carries no locking; the owner
//! serializes access (the Windows backend keeps its single instance in a `Mutex`).

use log::info;

use crate::Result;

/// Registers and removes the dispatcher with the operating system.
pub trait HandlerInstaller {
    /// Proof of a successful installation, handed back on removal.
    type Handle;

    /// Installs the dispatcher.
    ///
    /// # Errors
    ///
    /// Returns an error if the handler could not be installed, or if a policy it depends
    /// on could not be prepared.
    fn install(&mut self) -> Result<Self::Handle>;

    /// Removes an installation made by [`install`](Self::install).
    fn remove(&mut self, handle: Self::Handle);
}

/// Whether the dispatcher is currently installed.
///
/// # Example
///
/// ```rust
/// use sehveh::{Enablement, HandlerInstaller, Result};
///
/// struct Counter(u32);
///
/// impl HandlerInstaller for Counter {
///     type Handle = u32;
///
///     fn install(&mut self) -> Result<u32> {
///         self.0 += 1;
///         Ok(self.0)
///     }
///
///     fn remove(&mut self, _handle: u32) {}
/// }
///
/// let mut state = Enablement::new(Counter(0));
/// state.enable()?;
/// state.enable()?;
/// assert!(state.is_enabled());
/// assert_eq!(state.installer().0, 1);
///
/// state.disable();
/// assert!(!state.is_enabled());
/// # Ok::<(), sehveh::Error>(())
/// ```
#[derive(Debug)]
pub struct Enablement<I: HandlerInstaller> {
    installer: I,
    handle: Option<I::Handle>,
}

impl<I: HandlerInstaller> Enablement<I> {
    /// Creates a disabled state that installs through `installer`.
    pub const fn new(installer: I) -> Self {
        Self {
            installer,
            handle: None,
        }
    }

    /// Installs the dispatcher unless it is already installed.
    ///
    /// # Errors
    ///
    /// Returns the installer's error; the state stays disabled.
    pub fn enable(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }

        self.handle = Some(self.installer.install()?);
        info!("Exception dispatcher enabled");
        Ok(())
    }

    /// Removes the dispatcher if it is installed.
    pub fn disable(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.installer.remove(handle);
            info!("Exception dispatcher disabled");
        }
    }

    /// Whether the dispatcher is installed.
    pub fn is_enabled(&self) -> bool {
        self.handle.is_some()
    }

    /// The installer in use.
    pub fn installer(&self) -> &I {
        &self.installer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[derive(Default)]
    struct Recording {
        installs: u32,
        removed: Vec<u32>,
        fail: bool,
    }

    impl HandlerInstaller for Recording {
        type Handle = u32;

        fn install(&mut self) -> Result<u32> {
            if self.fail {
                return Err(Error::InstallFailed);
            }
            self.installs += 1;
            Ok(self.installs)
        }

        fn remove(&mut self, handle: u32) {
            self.removed.push(handle);
        }
    }

    #[test]
    fn enable_and_disable_are_idempotent() {
        let mut state = Enablement::new(Recording::default());
        assert!(!state.is_enabled());

        state.disable();
        assert!(state.installer().removed.is_empty());

        state.enable().unwrap();
        state.enable().unwrap();
        assert!(state.is_enabled());
        assert_eq!(state.installer().installs, 1);

        state.disable();
        state.disable();
        assert!(!state.is_enabled());
        assert_eq!(state.installer().removed, vec![1]);

        state.enable().unwrap();
        assert_eq!(state.installer().installs, 2);
    }

    #[test]
    fn failed_install_stays_disabled() {
        let mut state = Enablement::new(Recording {
            fail: true,
            ..Recording::default()
        });

        assert!(matches!(state.enable(), Err(Error::InstallFailed)));
        assert!(!state.is_enabled());

        state.disable();
        assert!(state.installer().removed.is_empty());
    }
}
