use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

pub(crate) const TRACE_FILE_ENV: &str = "PARLEY_TRACE_FILE";

/// Keeps the JSONL writer alive; buffered lines are flushed on drop.
#[derive(Debug)]
pub(crate) struct TracingGuard {
    _guards: Vec<WorkerGuard>,
}

/// Install the global subscriber.
///
/// The console layer writes to stderr so stdout stays free for the
/// terminal conversation; it follows `RUST_LOG` and defaults to `info`.
/// Setting `PARLEY_TRACE_FILE` adds a JSONL layer at `debug` with span
/// open/close events, which is where batch timers and flushes show up.
pub(crate) fn init() -> TracingGuard {
    let mut guards = Vec::new();

    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    let jsonl_layer = std::env::var(TRACE_FILE_ENV).ok().map(|trace_file| {
        let (dir, filename) = split_trace_path(&trace_file);
        let file_appender = tracing_appender::rolling::never(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        guards.push(guard);

        let jsonl_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

        fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_span_list(true)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_filter(jsonl_filter)
    });

    Registry::default()
        .with(console_layer)
        .with(jsonl_layer)
        .init();

    TracingGuard { _guards: guards }
}

fn split_trace_path(trace_file: &str) -> (PathBuf, String) {
    let path = Path::new(trace_file);
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();
    let filename = path.file_name().map_or_else(
        || "traces.jsonl".to_owned(),
        |f| f.to_string_lossy().into_owned(),
    );
    (dir, filename)
}
