//! Conditional logging macros gated on a module-level `ENABLE_LOGS` flag.
//!
//! Chatty modules (the watch loop in particular) route their logging through
//! these so a whole module can be silenced with one const flip:
//!
//! ```rust
//! const ENABLE_LOGS: bool = true;
//!
//! use permitwatch::log_info;
//!
//! log_info!("only emitted when ENABLE_LOGS is true");
//! ```

/// Conditional info logging; the calling module must define `ENABLE_LOGS`.
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::info!($($arg)*);
        }
    };
}

/// Conditional warn logging; the calling module must define `ENABLE_LOGS`.
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::warn!($($arg)*);
        }
    };
}

/// Conditional error logging; the calling module must define `ENABLE_LOGS`.
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::error!($($arg)*);
        }
    };
}
