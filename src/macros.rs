#![allow(unused_macros)]

/// Helper macro for locking items
///
/// A poisoned lock is recovered rather than propagated: the guarded state is only ever
/// replaced wholesale, and the callers run inside exception handlers where a panic
/// would abort the process.
///
/// ```rust, ignore
///  let mut data = lock!(my_mutex);
///  data.some_field = 42;
/// ```
macro_rules! lock {
    ($lock:expr) => {
        $lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    };
}
