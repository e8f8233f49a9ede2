use std::env;

use sentry::integrations::tracing::EventFilter;
use tracing::Subscriber;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{Config, LogFormat, Logging};

/// The filter directives used when `RUST_LOG` is not set.
///
/// Only this crate logs below `INFO`.
fn default_filter(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::OFF => "",
        LevelFilter::ERROR => "ERROR",
        LevelFilter::WARN => "WARN",
        LevelFilter::INFO => "INFO",
        LevelFilter::DEBUG => {
            "INFO,\
             stowage_service=DEBUG"
        }
        LevelFilter::TRACE => {
            "INFO,\
             stowage_service=TRACE"
        }
    }
}

/// Resolves [`LogFormat::Auto`] depending on whether a user watches the output.
fn effective_format(format: LogFormat, attended: bool) -> LogFormat {
    match format {
        LogFormat::Auto if attended => LogFormat::Pretty,
        LogFormat::Auto => LogFormat::Simplified,
        other => other,
    }
}

/// Creates the layer that formats events as configured in `logging` and writes them to
/// `make_writer`.
pub fn fmt_layer<S, W>(logging: &Logging, make_writer: W) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_writer(make_writer);

    match effective_format(logging.format, console::user_attended()) {
        LogFormat::Auto | LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Simplified => layer.compact().with_ansi(false).boxed(),
        LogFormat::Json => layer
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
    }
}

/// Initializes logging to `stdout`, plus reporting to sentry.
///
/// The `RUST_LOG` environment variable takes precedence over the configured level. If
/// [`enable_backtraces`](crate::config::Logging::enable_backtraces) is set, this also sets
/// `RUST_BACKTRACE`.
///
/// Calling this more than once is harmless, only the first subscriber is installed.
///
/// # Safety
/// This function uses [`std::env::set_var`] to modify the environment. That function is only safe
/// to call in single-threaded contexts to prevent unsynchronized concurrent access to the environment.
pub unsafe fn init_logging(config: &Config) {
    if config.logging.enable_backtraces {
        // SAFETY: As documented, this function may only be called in a single-threaded context.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let filter = env::var("RUST_LOG")
        .unwrap_or_else(|_| default_filter(config.logging.level).to_string());

    // Errors become sentry events, and everything down to INFO is sent as sentry logs.
    let sentry_layer =
        sentry::integrations::tracing::layer().event_filter(|md| match *md.level() {
            tracing::Level::ERROR => EventFilter::Event | EventFilter::Log,
            tracing::Level::WARN | tracing::Level::INFO => EventFilter::Log,
            tracing::Level::DEBUG | tracing::Level::TRACE => EventFilter::Ignore,
        });

    tracing_subscriber::registry()
        .with(fmt_layer(&config.logging, std::io::stdout).with_filter(EnvFilter::new(&filter)))
        .with(sentry_layer)
        .try_init()
        .ok();
}

/// Logs an error to the configured logger or `stderr` if not yet configured.
pub fn ensure_log_error(error: &anyhow::Error) {
    if tracing::Level::ERROR <= tracing::level_filters::STATIC_MAX_LEVEL
        && tracing::Level::ERROR <= LevelFilter::current()
    {
        tracing::error!("{:?}", error);
    } else {
        eprintln!("{error:?}");
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::{Arc, Mutex, PoisonError};

    use super::*;

    /// Collects everything written by a formatting layer.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        fn text(&self) -> String {
            let bytes = self.0.lock().unwrap_or_else(PoisonError::into_inner);
            String::from_utf8_lossy(&bytes).into_owned()
        }
    }

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn log_with(format: LogFormat) -> String {
        let captured = Captured::default();
        let logging = Logging {
            format,
            ..Default::default()
        };
        let writer = captured.clone();
        let subscriber =
            tracing_subscriber::registry().with(fmt_layer(&logging, move || writer.clone()));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(entries = 3, "Opened disk cache");
        });
        captured.text()
    }

    #[test]
    fn test_default_filter() {
        assert_eq!(default_filter(LevelFilter::OFF), "");
        assert_eq!(default_filter(LevelFilter::WARN), "WARN");
        assert_eq!(
            default_filter(LevelFilter::TRACE),
            "INFO,stowage_service=TRACE"
        );
    }

    #[test]
    fn test_auto_format() {
        assert_eq!(effective_format(LogFormat::Auto, true), LogFormat::Pretty);
        assert_eq!(effective_format(LogFormat::Auto, false), LogFormat::Simplified);
        assert_eq!(effective_format(LogFormat::Json, true), LogFormat::Json);
    }

    #[test]
    fn test_json_format() {
        let output = log_with(LogFormat::Json);
        let line: serde_json::Value = serde_json::from_str(output.trim()).unwrap();

        assert_eq!(line["message"], "Opened disk cache");
        assert_eq!(line["entries"], 3);
        assert_eq!(line["level"], "INFO");
        assert!(
            line["target"]
                .as_str()
                .unwrap()
                .starts_with("stowage_service::logging")
        );
    }

    #[test]
    fn test_simplified_format() {
        let output = log_with(LogFormat::Simplified);
        assert!(output.contains("Opened disk cache"), "{output}");
        assert!(output.contains("entries=3"), "{output}");
        assert!(!output.contains('\u{1b}'), "no colors expected: {output:?}");
    }

    #[test]
    fn test_ensure_log_error_without_subscriber() {
        // falls back to stderr, must not panic
        ensure_log_error(&anyhow::anyhow!("disk full").context("failed to open disk cache"));
    }
}
