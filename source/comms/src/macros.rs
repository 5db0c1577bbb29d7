#![allow(unused_macros)]

#[cfg(feature = "log-logging")]
macro_rules! han_log {
    (trace,   $($arg:tt)*) => { log::trace!($($arg)*) };
    (debug,   $($arg:tt)*) => { log::debug!($($arg)*) };
    (info,    $($arg:tt)*) => { log::info!($($arg)*) };
    (warn,    $($arg:tt)*) => { log::warn!($($arg)*) };
    (error,   $($arg:tt)*) => { log::error!($($arg)*) };
}

#[cfg(not(feature = "log-logging"))]
macro_rules! han_log {
    ($level:ident, $($arg:tt)*) => {{ let _ = format_args!($($arg)*); }}
}

macro_rules! han_trace {
    ($($arg:tt)*) => (han_log!(trace, $($arg)*));
}

macro_rules! han_debug {
    ($($arg:tt)*) => (han_log!(debug, $($arg)*));
}

macro_rules! han_info {
    ($($arg:tt)*) => (han_log!(info, $($arg)*));
}

macro_rules! han_warn {
    ($($arg:tt)*) => (han_log!(warn, $($arg)*));
}

macro_rules! han_error {
    ($($arg:tt)*) => (han_log!(error, $($arg)*));
}
