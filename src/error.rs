use thiserror::Error;

use crate::{record::ExceptionRecord, status};

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which covers every failure this library can surface.
///
/// Most variants are not "errors" in the usual sense of something a caller recovers
/// from: they describe a terminal condition of a dispatch or unwind pass that the
/// backend turns into a new, non-continuable exception. [`Error::status`] gives the
/// status code that exception carries and [`Error::into_record`] builds it.
///
/// # Error Categories
///
/// ## Protocol violations
/// - [`Error::InvalidDisposition`] - A handler returned a value outside the disposition set
/// - [`Error::NoncontinuableContinued`] - A handler continued a non-continuable exception
///
/// ## Chain corruption and ordering
/// - [`Error::BadStack`] - A registration record outside the stack or misaligned (unwind only)
/// - [`Error::InvalidUnwindTarget`] - The unwind target is newer than a frame already passed
///
/// ## Filter policies
/// - [`Error::SehDisabled`] - The top handler lives in an image that declares `NO_SEH`
/// - [`Error::TraceCapture`] - The throw-path calibration captured too few frames
/// - [`Error::OriginUnresolved`] - The origin heuristic could not classify a fault
///
/// ## Image parsing
/// - [`Error::OutOfBounds`] - A read would leave the mapped image
/// - [`Error::Malformed`] - Structurally invalid image data
/// - [`Error::GoblinErr`] - PE header parsing errors from goblin
///
/// ## Installation
/// - [`Error::InstallFailed`] - The OS refused to register the vectored handler
///
/// # Examples
///
/// ```rust
/// use sehveh::{status, Error};
///
/// let error = Error::InvalidDisposition(42);
/// assert_eq!(error.status(), status::STATUS_INVALID_DISPOSITION);
/// assert!(error.first_chance());
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// A handler returned a disposition the invoking pass does not accept.
    ///
    /// The raw value is kept since it may not correspond to any [`crate::Disposition`]
    /// at all (for example a handler that returns garbage in `eax`).
    #[error("Handler returned an invalid disposition - {0}")]
    InvalidDisposition(i32),

    /// A handler asked to continue execution of a non-continuable exception.
    #[error("Handler attempted to continue a non-continuable exception")]
    NoncontinuableContinued,

    /// The unwind target is at a lower address than a record already walked past.
    ///
    /// Records on a chain ascend in address from newest to oldest, so a target below
    /// the current record can never be reached.
    #[error("Unwind target {target:#x} lies below registration record {frame:#x}")]
    InvalidUnwindTarget {
        /// The requested target frame
        target: usize,
        /// The record that was being visited when the violation was detected
        frame: usize,
    },

    /// A registration record is outside the thread's stack or is misaligned.
    #[error("Registration record {0:#x} is outside the stack limits or misaligned")]
    BadStack(usize),

    /// The handler's image declares `IMAGE_DLLCHARACTERISTICS_NO_SEH`.
    ///
    /// The associated value is the base address of the image.
    #[error("Image at {0:#x} does not use structured exception handling")]
    SehDisabled(usize),

    /// The throw-path calibration produced fewer frames than required.
    ///
    /// The associated value is the number of frames that were captured.
    #[error("Failed to capture the throw path - {0} frame(s) captured")]
    TraceCapture(usize),

    /// The origin heuristic could not find a frame to classify.
    #[error("Failed to resolve the origin of the exception")]
    OriginUnresolved,

    /// An out of bound access was attempted while reading an image.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// The image is damaged and could not be interpreted.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// Error from the goblin crate during PE header parsing.
    #[error("{0}")]
    GoblinErr(#[from] goblin::error::Error),

    /// The vectored handler could not be registered.
    #[error("Failed to install the vectored exception handler")]
    InstallFailed,
}

impl Error {
    /// The status code of the secondary exception this error is raised as.
    #[must_use]
    pub fn status(&self) -> u32 {
        match self {
            Error::InvalidDisposition(_) => status::STATUS_INVALID_DISPOSITION,
            Error::NoncontinuableContinued => status::STATUS_NONCONTINUABLE_EXCEPTION,
            Error::InvalidUnwindTarget { .. } => status::STATUS_INVALID_UNWIND_TARGET,
            Error::BadStack(_) => status::STATUS_BAD_STACK,
            Error::SehDisabled(_)
            | Error::OutOfBounds
            | Error::Malformed { .. }
            | Error::GoblinErr(_) => status::STATUS_INVALID_EXCEPTION_HANDLER,
            Error::TraceCapture(_) => status::STATUS_TRACE_CAPTURE_FAILED,
            Error::OriginUnresolved => status::STATUS_ORIGIN_UNRESOLVED,
            Error::InstallFailed => status::STATUS_UNSUCCESSFUL,
        }
    }

    /// Whether the secondary exception goes through dispatch again.
    ///
    /// Protocol violations are raised as ordinary first-chance exceptions so that outer
    /// handlers get to see them. Failures of the filter policies are raised as second
    /// chance, since dispatching them would consult the same failing filter again.
    #[must_use]
    pub fn first_chance(&self) -> bool {
        matches!(
            self,
            Error::InvalidDisposition(_)
                | Error::NoncontinuableContinued
                | Error::InvalidUnwindTarget { .. }
                | Error::BadStack(_)
        )
    }

    /// Builds the non-continuable exception record for this error.
    ///
    /// # Arguments
    ///
    /// * `chained` - The exception that was being processed when this error occurred,
    ///   or null if there was none
    #[must_use]
    pub fn into_record(self, chained: *mut ExceptionRecord) -> ExceptionRecord {
        ExceptionRecord::secondary(self.status(), chained)
    }
}
