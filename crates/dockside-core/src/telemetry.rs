//! Tracing setup for the `dockside` binary.
//!
//! Logs go to stderr so the run summary on stdout stays clean. Without
//! `RUST_LOG`, only Dockside's own crates log at the requested level and
//! everything else (reqwest, hyper) is held at `warn`.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const CRATES: [&str; 3] = ["dockside", "dockside_core", "dockside_pipeline"];

/// Filter directives used when `RUST_LOG` is unset.
pub fn default_filter(level: Level) -> String {
    let mut directives = vec!["warn".to_string()];
    directives.extend(CRATES.iter().map(|krate| format!("{krate}={level}")));
    directives.join(",")
}

/// Install the global subscriber. `json` switches to one JSON object per
/// line, carrying the current span (run id, command) on each event.
///
/// Only the first call takes effect.
pub fn init_tracing(json: bool, level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(level)));

    let (json_layer, text_layer) = if json {
        let format = fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr);
        (Some(format.json().with_current_span(true)), None)
    } else {
        let format = fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr);
        (None, Some(format))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_does_not_panic() {
        init_tracing(false, Level::INFO);
        init_tracing(true, Level::DEBUG);
    }

    #[test]
    fn default_filter_scopes_to_own_crates() {
        let filter = default_filter(Level::DEBUG);
        assert!(filter.starts_with("warn,"));
        assert!(filter.contains("dockside_pipeline=DEBUG"));
        assert!(!filter.contains("reqwest"));
        assert!(EnvFilter::try_new(&filter).is_ok());
    }
}
