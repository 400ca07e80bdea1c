//! Crate-local logging helpers.

/// Logs at `error` level and then aborts the process.
///
/// Reserved for violations of invariants this crate treats as programmer
/// error rather than a runtime condition to recover from — calling an
/// `EventLoop` from the wrong thread, constructing a second loop on a
/// thread that already owns one. Ordinary runtime failures (EMFILE,
/// ECONNRESET, a broken pipe mid-write) are logged and absorbed instead;
/// see the crate's error-handling notes.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        std::process::abort();
    }};
}
