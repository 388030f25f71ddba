//! Tracing subscriber setup shared by the worker host and the CLI.
//!
//! Logs go to stderr so command output on stdout stays machine-readable.

use tracing::{Level, Subscriber};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Targets that are noisy below `warn` whatever the chosen level.
const QUIET_TARGETS: &[&str] = &["hyper", "hyper_util", "reqwest", "rustls"];

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, human oriented.
    #[default]
    Pretty,
    /// One line per event.
    Compact,
    /// Newline-delimited JSON.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub format: LogFormat,
    /// Print file and line of each event.
    pub include_location: bool,
    /// Emit span enter/close events (one per worker event dispatch).
    pub include_span_events: bool,
    /// Directive string such as `"finsync_worker=debug,finsync_store=trace"`.
    /// Takes precedence over `RUST_LOG`.
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            include_location: false,
            include_span_events: false,
            filter: None,
        }
    }
}

impl LogConfig {
    /// Verbose output with locations and span events.
    pub fn debug() -> Self {
        Self {
            level: Level::DEBUG,
            include_location: true,
            include_span_events: true,
            ..Default::default()
        }
    }

    /// JSON at info, for collected logs.
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            ..Default::default()
        }
    }

    /// Map a `-v` count from the command line to a level.
    pub fn from_verbosity(verbosity: u8) -> Self {
        let level = match verbosity {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        };
        Self {
            level,
            include_location: verbosity >= 2,
            ..Default::default()
        }
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Directives used when neither a custom filter nor `RUST_LOG` is set.
    pub fn default_directives(&self) -> String {
        let mut directives = vec![self.level.to_string().to_ascii_lowercase()];
        if self.level > Level::WARN {
            directives.extend(QUIET_TARGETS.iter().map(|t| format!("{}=warn", t)));
        }
        directives.join(",")
    }

    fn env_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.default_directives());
        match self.filter {
            Some(ref custom) => EnvFilter::try_new(custom).unwrap_or_else(|_| fallback()),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback()),
        }
    }

    fn fmt_layer<S>(&self) -> Box<dyn Layer<S> + Send + Sync>
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        let span_events = if self.include_span_events {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_file(self.include_location)
            .with_line_number(self.include_location)
            .with_span_events(span_events);

        match self.format {
            LogFormat::Pretty => layer.pretty().boxed(),
            LogFormat::Compact => layer.compact().boxed(),
            LogFormat::Json => layer.json().boxed(),
        }
    }
}

/// Install the global subscriber.
///
/// Returns `false` when one was already installed (tests call this freely).
pub fn init_logging(config: LogConfig) -> bool {
    tracing_subscriber::registry()
        .with(config.env_filter())
        .with(config.fmt_layer())
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_verbosity() {
        assert_eq!(LogConfig::from_verbosity(0).level, Level::WARN);
        assert_eq!(LogConfig::from_verbosity(2).level, Level::DEBUG);
        assert!(LogConfig::from_verbosity(2).include_location);
        assert_eq!(LogConfig::from_verbosity(9).level, Level::TRACE);
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_default_directives_quiet_http_stack() {
        let directives = LogConfig::debug().default_directives();
        assert!(directives.starts_with("debug,"));
        assert!(directives.contains("reqwest=warn"));

        assert_eq!(LogConfig::from_verbosity(0).default_directives(), "warn");
    }

    #[test]
    fn test_custom_filter() {
        let config = LogConfig::production().with_filter("finsync_worker=debug");
        assert_eq!(config.filter.as_deref(), Some("finsync_worker=debug"));
        assert_eq!(config.format, LogFormat::Json);
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_logging(LogConfig::default());
        assert!(!init_logging(LogConfig::default()));
    }
}
