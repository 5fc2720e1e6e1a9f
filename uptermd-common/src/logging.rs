use time::macros::format_description;
use tracing_subscriber::fmt::time::OffsetTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LogFormat;

/// Picks the `RUST_LOG` default the way the CLI's `-d`/`--debug` flag count
/// escalates verbosity: unset -> info, once -> debug, twice -> + russh debug,
/// three or more -> everything.
pub fn default_rust_log(debug_level: u8) -> &'static str {
    match debug_level {
        0 => "uptermd=info",
        1 => "uptermd=debug",
        2 => "uptermd=debug,russh=debug",
        _ => "debug",
    }
}

/// Sets up the global `tracing` subscriber. `format` resolves the JSON vs.
/// text choice (an explicit CLI flag always wins over the configured
/// default); text output further splits into an interactive form (compact,
/// no target, local time) and a non-interactive form (full, for log
/// aggregators that don't want ANSI) depending on whether stdout is a tty.
pub fn init_logging(debug_level: u8, format: LogFormat) {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", default_rust_log(debug_level));
    }

    let make_filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let use_json = match format {
        LogFormat::Json => true,
        LogFormat::Text => false,
        LogFormat::Auto => !console::user_attended(),
    };

    let timer = OffsetTime::new(
        time::UtcOffset::current_local_offset().unwrap_or(time::UtcOffset::UTC),
        format_description!("[hour]:[minute]:[second]"),
    );

    if use_json {
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_timer(timer)
            .with_filter(make_filter());
        tracing_subscriber::registry().with(layer).init();
    } else if console::user_attended() {
        let layer = tracing_subscriber::fmt::layer()
            .compact()
            .with_target(false)
            .with_timer(timer)
            .with_filter(make_filter());
        tracing_subscriber::registry().with(layer).init();
    } else {
        let layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_timer(timer)
            .with_filter(make_filter());
        tracing_subscriber::registry().with(layer).init();
    }

    let _ = tracing_log::LogTracer::init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_level_escalates_verbosity() {
        assert_eq!(default_rust_log(0), "uptermd=info");
        assert_eq!(default_rust_log(1), "uptermd=debug");
        assert_eq!(default_rust_log(2), "uptermd=debug,russh=debug");
        assert_eq!(default_rust_log(9), "debug");
    }
}
