//! Tracing setup.
//!
//! Diagnostics go to stderr, filtered by `DOCCHAT_LOG` (an `EnvFilter`
//! directive, default `info`). Answered queries are additionally written as
//! JSON lines to the query log, which only receives events with target
//! `query_log`.

use std::path::Path;

use tracing::{Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::{Filtered, Targets};
use tracing_subscriber::fmt::{self, format::Format, format::Json, format::JsonFields, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Target of the per-query events written to the query log.
pub const QUERY_LOG_TARGET: &str = "query_log";

/// Install the global subscriber. With `query_log`, the returned guard must be
/// held for as long as events should reach the file.
pub fn init_tracing(verbose: u8, query_log: Option<&Path>) -> Option<WorkerGuard> {
    let directive = std::env::var("DOCCHAT_LOG").unwrap_or_else(|_| {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
        .to_string()
    });
    let stderr_filter = EnvFilter::try_new(format!("{},{}=off", directive, QUERY_LOG_TARGET))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(stderr_filter);

    let (query_layer, guard) = match query_log {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .map(|f| f.to_os_string())
                .unwrap_or_else(|| "query_log.log".into());
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(query_log_layer(writer)), Some(guard))
        }
        None => (None, None),
    };

    // try_init: tests and embedders may have installed a subscriber already
    let _ = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(query_layer)
        .try_init();

    guard
}

/// JSON-lines file layer for the query log.
pub type QueryLogLayer<S, W> = Filtered<fmt::Layer<S, JsonFields, Format<Json>, W>, Targets, S>;

/// JSON-lines layer that only passes `query_log` events to `writer`.
pub fn query_log_layer<S, W>(writer: W) -> QueryLogLayer<S, W>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    fmt::layer()
        .json()
        .with_writer(writer)
        .with_filter(Targets::new().with_target(QUERY_LOG_TARGET, Level::INFO))
}
