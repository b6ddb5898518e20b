//! Log output: one line per event, prefixed with a short severity tag.
//!
//! `tracing` has no fatal level, so fatal events are `error!` events with
//! target [`FATAL_TARGET`].

use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

pub const FATAL_TARGET: &str = "fatal";

/// Keeps FATAL lines visible under crate-scoped filters like `pvguard=debug`.
const FATAL_DIRECTIVE: &str = "fatal=error";

/// Install the global subscriber. `--quiet` wins over `--verbose`;
/// `RUST_LOG` wins over both.
pub fn init(verbose: bool, quiet: bool) {
    let level = if quiet {
        "error"
    } else if verbose {
        "debug"
    } else {
        "info"
    };
    let filter = with_fatal(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
    );

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .event_format(SeverityFormat)
        .init();
}

fn with_fatal(filter: EnvFilter) -> EnvFilter {
    match FATAL_DIRECTIVE.parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    }
}

pub fn severity_tag(level: &Level, target: &str) -> &'static str {
    if *level == Level::ERROR {
        if target == FATAL_TARGET {
            "FATAL"
        } else {
            "ERR"
        }
    } else if *level == Level::WARN {
        "WARN"
    } else if *level == Level::INFO {
        "INF"
    } else if *level == Level::DEBUG {
        "DBG"
    } else {
        "TRC"
    }
}

/// `2024-05-01T10:00:00.123Z INF: message key=value`
pub struct SeverityFormat;

impl<S, N> FormatEvent<S, N> for SeverityFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let meta = event.metadata();
        write!(
            writer,
            "{} {}: ",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            severity_tag(meta.level(), meta.target())
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_tags() {
        assert_eq!(severity_tag(&Level::ERROR, FATAL_TARGET), "FATAL");
        assert_eq!(severity_tag(&Level::ERROR, "pvguard::watchdog"), "ERR");
        assert_eq!(severity_tag(&Level::WARN, FATAL_TARGET), "WARN");
        assert_eq!(severity_tag(&Level::INFO, "pvguard"), "INF");
        assert_eq!(severity_tag(&Level::DEBUG, "pvguard"), "DBG");
    }

    #[test]
    fn test_fatal_target_survives_scoped_filter() {
        let filter = with_fatal(EnvFilter::new("pvguard=debug"));
        let rendered = filter.to_string();
        assert!(rendered.contains("pvguard=debug"), "{rendered}");
        assert!(rendered.contains("fatal=error"), "{rendered}");
    }
}
