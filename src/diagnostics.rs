//! Diagnostics for the allocators.
//!
//! Everything the allocators have to say goes through the [`log`] facade, so the
//! embedding application decides where (and whether) it ends up. Advisories come in
//! four [`Severity`] tiers; conditions that mean memory is already corrupted take the
//! fatal path, which logs and then panics.

use std::fmt;

/// Log target used for every message emitted by this crate.
pub const LOG_TARGET: &str = "memarena";

/// Severity of an advisory. Execution always continues after one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Something worked but could be cheaper (e.g. an allocator had to grow).
    Optimization,
    Low,
    Medium,
    /// Visible problems such as leaks found at teardown.
    High,
}

impl Severity {
    /// The [`log::Level`] the advisory is emitted at.
    pub const fn level(self) -> log::Level {
        match self {
            Severity::Optimization => log::Level::Debug,
            Severity::Low => log::Level::Info,
            Severity::Medium => log::Level::Warn,
            Severity::High => log::Level::Error,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Optimization => write!(f, "OPTIMIZATION"),
            Severity::Low => write!(f, "LOW"),
            Severity::Medium => write!(f, "MEDIUM"),
            Severity::High => write!(f, "HIGH"),
        }
    }
}

/// Emits an advisory at the given [`Severity`].
macro_rules! advise {
    ($severity:expr, $($arg:tt)+) => {{
        let severity: $crate::diagnostics::Severity = $severity;
        ::log::log!(
            target: $crate::diagnostics::LOG_TARGET,
            severity.level(),
            "[{}] {}",
            severity,
            format_args!($($arg)+)
        );
    }};
}

/// Logs the message at error level and panics with it.
macro_rules! fatal {
    ($($arg:tt)+) => {{
        ::log::error!(
            target: $crate::diagnostics::LOG_TARGET,
            "[FATAL] {}",
            format_args!($($arg)+)
        );
        panic!($($arg)+)
    }};
}

pub(crate) use advise;
pub(crate) use fatal;
