//! Helper macros for logging (console printing).

use std::sync::OnceLock;

use env_logger::Env;

/// Global variable holding the process identity string used as logging
/// prefix: "m" for the master, "n:<port>" for storage nodes, "c" for clients.
pub static ME: OnceLock<String> = OnceLock::new();

/// Identity prefix of this process, or "-" before `set_me()`.
#[doc(hidden)]
pub fn me_prefix() -> &'static str {
    ME.get().map_or("-", |me| me.as_str())
}

/// Logs at the given `log` level with the process identity in parentheses;
/// the `pf_*!` macros below are shorthands of this one.
///
/// Example:
/// ```no_compile
/// pf_log!(log::Level::Info, "stored '{}' partition {}", file, index);
/// ```
#[macro_export]
macro_rules! pf_log {
    ($level:expr, $($fmt_args:tt)*) => {
        log::log!(
            $level,
            "({}) {}",
            $crate::me_prefix(),
            format!($($fmt_args)*)
        )
    };
}

#[macro_export]
macro_rules! pf_trace {
    ($($fmt_args:tt)*) => {
        $crate::pf_log!(log::Level::Trace, $($fmt_args)*)
    };
}

#[macro_export]
macro_rules! pf_debug {
    ($($fmt_args:tt)*) => {
        $crate::pf_log!(log::Level::Debug, $($fmt_args)*)
    };
}

#[macro_export]
macro_rules! pf_info {
    ($($fmt_args:tt)*) => {
        $crate::pf_log!(log::Level::Info, $($fmt_args)*)
    };
}

#[macro_export]
macro_rules! pf_warn {
    ($($fmt_args:tt)*) => {
        $crate::pf_log!(log::Level::Warn, $($fmt_args)*)
    };
}

#[macro_export]
macro_rules! pf_error {
    ($($fmt_args:tt)*) => {
        $crate::pf_log!(log::Level::Error, $($fmt_args)*)
    };
}

/// Initialize `env_logger` to desired configuration if haven't.
pub fn logger_init() {
    let _ =
        env_logger::Builder::from_env(Env::default().default_filter_or("info"))
            .format_timestamp(None)
            .format_module_path(false)
            .format_target(false)
            .try_init();
}

/// Sets the process identity prefix for logging if not set yet. Nodes and
/// master living in the same process (as in tests) share the first one.
pub fn set_me(me: impl ToString) {
    let _ = ME.set(me.to_string());
}

/// Log an error string to logger and then return a `SplitfsError`
/// containing the string.
///
/// Example:
/// ```no_compile
/// let e = logged_err!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! logged_err {
    ($($fmt_args:tt)*) => {
        {
            $crate::pf_error!($($fmt_args)*);
            Err($crate::SplitfsError::msg(format!($($fmt_args)*)))
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::SplitfsError;

    #[test]
    fn prefix_is_first_identity() {
        set_me("n:7001");
        set_me("m");
        assert_eq!(me_prefix(), "n:7001");
    }

    #[test]
    fn error_no_args() {
        assert_eq!(
            logged_err!("interesting message"),
            Err::<(), SplitfsError>(SplitfsError::msg("interesting message"))
        );
    }

    #[test]
    fn error_with_args() {
        assert_eq!(
            logged_err!("got {} to print", 777),
            Err::<(), SplitfsError>(SplitfsError::msg("got 777 to print"))
        );
    }
}
