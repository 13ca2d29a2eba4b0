//! Telemetry initialization (tracing/tracing-subscriber).
//!
//! Behavior:
//! - LOG_LEVEL controls the filter (e.g. "debug" or detailed directives like
//!   "info,pipeline=debug,validation=debug,triviagen=debug").
//! - LOG_FORMAT selects "pretty" (default) or "json" structured logs.
//! - When LOG_LEVEL is unset, `ClientConfig.debug_logging` raises the
//!   default filter via `init_tracing_with`.
//!
//! Notes:
//! - We include targets in the output to disambiguate sources; the pipeline
//!   logs under `pipeline`, fact-checking under `validation`.

use tracing_subscriber::EnvFilter;

fn default_directives(debug_logging: bool) -> &'static str {
    if debug_logging {
        "debug,triviagen=trace,pipeline=trace,validation=trace"
    } else {
        "info,triviagen=debug,pipeline=debug,validation=debug"
    }
}

pub fn init_tracing() {
    init_tracing_with(false);
}

pub fn init_tracing_with(debug_logging: bool) {
    // Build a single fmt subscriber builder and attach the EnvFilter directly.
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .unwrap_or_else(|_| EnvFilter::new(default_directives(debug_logging)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    // Choose JSON vs pretty; don't try to store different layer types.
    match std::env::var("LOG_FORMAT").as_deref() {
        Ok("json") => {
            builder.json().init();
        }
        _ => {
            builder.init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_logging_raises_the_default_filter() {
        assert!(default_directives(true).starts_with("debug"));
        assert!(default_directives(false).starts_with("info"));
    }
}
