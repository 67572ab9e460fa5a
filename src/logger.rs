use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Parse a log level name, case-insensitive
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// Level used for a given `--log-mode` and `--verbose` combination.
    ///
    /// Verbose events are logged at debug, so the verbose flag lowers the
    /// level to debug unless trace was asked for.
    pub fn resolve(log_mode: &str, verbose: bool) -> Self {
        let level = Self::parse(log_mode).unwrap_or_default();
        if verbose && level != LogLevel::Trace {
            LogLevel::Debug
        } else {
            level
        }
    }
}

/// Install the global subscriber; `RUST_LOG` overrides `level`
pub fn init_logger(level: LogLevel) {
    let filter = if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        env_filter
    } else {
        EnvFilter::new(format!("protho={}", level.as_str()))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(true)
                .with_ansi(true)
                .compact(),
        )
        .init();
}

pub mod log {
    pub use tracing::{debug, error, info, trace, warn};

    /// Stream connection lifecycle event (verbose)
    pub fn connection(peer: &str, event: &str) {
        debug!(peer = peer, event = event, "Connection");
    }

    /// Datagram session lifecycle event (verbose)
    pub fn session(peer: &str, event: &str) {
        debug!(peer = peer, event = event, "Session");
    }

    /// Forwarding started/stopped between two endpoints (verbose)
    pub fn forwarding(from: &str, to: &str, event: &str) {
        debug!(from = from, to = to, event = event, "Forwarding");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("trace"), Some(LogLevel::Trace));
        assert_eq!(LogLevel::parse("DEBUG"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("Info"), Some(LogLevel::Info));
        assert_eq!(LogLevel::parse("warn"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("error"), Some(LogLevel::Error));
        assert_eq!(LogLevel::parse("loud"), None);
    }

    #[test]
    fn test_log_level_resolve() {
        assert_eq!(LogLevel::resolve("info", false), LogLevel::Info);
        assert_eq!(LogLevel::resolve("info", true), LogLevel::Debug);
        assert_eq!(LogLevel::resolve("error", true), LogLevel::Debug);
        assert_eq!(LogLevel::resolve("trace", true), LogLevel::Trace);
        assert_eq!(LogLevel::resolve("bogus", false), LogLevel::Info);
    }
}
