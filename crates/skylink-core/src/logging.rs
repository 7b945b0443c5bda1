//! Log output for skylink.
//!
//! Every skylink crate logs through `tracing`; this module only decides
//! where those events go. Output is always stderr, so a command's own
//! output on stdout stays machine-readable.
//!
//! The client opens a `connection` span around its background task and a
//! `subscription` span around each subscription consumer. JSON lines carry
//! the current span's fields, and with [`LogConfig::spans`] set, closing a
//! span logs how long it lived.
//!
//! ```ignore
//! use skylink_core::logging::{init_logging, LogConfig};
//!
//! init_logging(&LogConfig::cli(true, false))?;
//! ```

use thiserror::Error;
use tracing::{Level, Subscriber};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, prelude::*};

/// Crates whose level follows [`Verbosity`]. Everything else, tungstenite
/// included, stays at `warn`.
const SKYLINK_TARGETS: [&str; 4] = [
    "skylink",
    "skylink_core",
    "skylink_protocol",
    "skylink_client",
];

/// Errors from [`init_logging`].
#[derive(Debug, Error)]
pub enum LogError {
    #[error("logging is already initialized: {0}")]
    AlreadyInitialized(#[from] tracing_subscriber::util::TryInitError),

    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),
}

/// How much skylink itself reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Verbosity {
    /// Warnings and errors: dropped connections, timeouts, malformed frames.
    #[default]
    Quiet,
    /// Plus lifecycle: connects, subscriptions going active, cancels.
    Normal,
    /// Plus every frame routed and every state change.
    Debug,
}

impl Verbosity {
    fn level(self) -> Level {
        match self {
            Self::Quiet => Level::WARN,
            Self::Normal => Level::INFO,
            Self::Debug => Level::DEBUG,
        }
    }
}

/// Line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Compact single lines for a terminal.
    #[default]
    Text,
    /// One JSON object per line, for log shippers.
    Json,
}

/// Logging setup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogConfig {
    pub verbosity: Verbosity,
    pub format: LogFormat,
    /// Log span close events with their busy/idle time.
    pub spans: bool,
    /// Explicit filter directive. Wins over `RUST_LOG`.
    pub filter: Option<String>,
}

impl LogConfig {
    /// Setup for the `skylink` binary: warnings only, or everything with
    /// span lifetimes when `debug` is set.
    #[must_use]
    pub fn cli(debug: bool, json: bool) -> Self {
        Self {
            verbosity: if debug {
                Verbosity::Debug
            } else {
                Verbosity::Quiet
            },
            format: if json { LogFormat::Json } else { LogFormat::Text },
            spans: debug,
            filter: None,
        }
    }

    /// Filter used when neither [`LogConfig::filter`] nor `RUST_LOG` is set.
    pub fn default_directive(&self) -> String {
        let level = self.verbosity.level();
        let mut directive = String::from("warn");
        for target in SKYLINK_TARGETS {
            directive.push_str(&format!(",{target}={level}"));
        }
        directive
    }

    fn env_filter(&self) -> Result<EnvFilter, LogError> {
        if let Some(ref filter) = self.filter {
            return Ok(EnvFilter::try_new(filter)?);
        }
        Ok(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.default_directive())))
    }

    /// The formatting layer, writing to `writer`. Source locations and
    /// targets are only shown at [`Verbosity::Debug`].
    pub fn layer<S, W>(&self, writer: W) -> Box<dyn Layer<S> + Send + Sync>
    where
        S: Subscriber + for<'a> LookupSpan<'a> + 'static,
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let detailed = self.verbosity == Verbosity::Debug;
        let span_events = if self.spans {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_span_events(span_events)
            .with_target(detailed)
            .with_file(detailed)
            .with_line_number(detailed);

        match self.format {
            LogFormat::Json => layer
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .boxed(),
            LogFormat::Text => layer.compact().without_time().boxed(),
        }
    }
}

/// Installs the global subscriber, writing to stderr. Call once at startup.
///
/// # Errors
///
/// Fails if a global subscriber is already set or the filter is invalid.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    let filter = config.env_filter()?;
    tracing_subscriber::registry()
        .with(filter)
        .with(config.layer(std::io::stderr))
        .try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    use serde_json::Value;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        fn lines(&self) -> Vec<Value> {
            let bytes = self.0.lock().unwrap();
            String::from_utf8_lossy(&bytes)
                .lines()
                .map(|line| serde_json::from_str(line).unwrap())
                .collect()
        }
    }

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn json_config(spans: bool) -> LogConfig {
        LogConfig {
            verbosity: Verbosity::Debug,
            format: LogFormat::Json,
            spans,
            filter: None,
        }
    }

    #[test]
    fn cli_setup() {
        let quiet = LogConfig::cli(false, false);
        assert_eq!(quiet.verbosity, Verbosity::Quiet);
        assert_eq!(quiet.format, LogFormat::Text);
        assert!(!quiet.spans);

        let debug = LogConfig::cli(true, true);
        assert_eq!(debug.verbosity, Verbosity::Debug);
        assert_eq!(debug.format, LogFormat::Json);
        assert!(debug.spans);
    }

    #[test]
    fn default_directive_raises_only_skylink_crates() {
        let directive = LogConfig::cli(true, false).default_directive();
        assert!(directive.starts_with("warn,"));
        assert!(directive.contains("skylink_client=DEBUG"));
        assert!(directive.contains("skylink_protocol=DEBUG"));
        assert!(!directive.contains("tungstenite"));
        assert!(EnvFilter::try_new(&directive).is_ok());

        let quiet = LogConfig::default().default_directive();
        assert!(quiet.contains("skylink_client=WARN"));
    }

    #[test]
    fn explicit_filter_is_validated() {
        let config = LogConfig {
            filter: Some("skylink_client=loud".to_string()),
            ..Default::default()
        };
        assert!(matches!(config.env_filter(), Err(LogError::Filter(_))));
    }

    #[test]
    fn json_lines_carry_the_subscription_span() {
        let captured = Captured::default();
        let subscriber =
            tracing_subscriber::registry().with(json_config(false).layer(captured.clone()));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("subscription", id = "sub-1", key = "parameter=X");
            let _entered = span.enter();
            tracing::info!(sequence = 7, "event delivered");
        });

        let lines = captured.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["fields"]["message"], "event delivered");
        assert_eq!(lines[0]["fields"]["sequence"], 7);
        assert_eq!(lines[0]["span"]["name"], "subscription");
        assert_eq!(lines[0]["span"]["id"], "sub-1");
        assert_eq!(lines[0]["span"]["key"], "parameter=X");
    }

    #[test]
    fn span_close_is_logged_when_enabled() {
        let captured = Captured::default();
        let subscriber =
            tracing_subscriber::registry().with(json_config(true).layer(captured.clone()));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("subscription", id = "sub-2");
            drop(span.enter());
        });

        let lines = captured.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["fields"]["message"], "close");
        assert!(lines[0]["fields"]["time.busy"].is_string());
    }
}
