//! Tracing setup.
//!
//! Logs go to stderr; stdout is reserved for sink records and the nodes file.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Filter directives for a `-v` count, used when `RUST_LOG` is unset.
pub fn default_directives(verbosity: u8) -> String {
    let (global, local) = match verbosity {
        0 => ("warn", "info"),
        1 => ("warn", "debug"),
        2 => ("info", "trace"),
        _ => ("debug", "trace"),
    };
    format!("{global},devp2p_sensor={local}")
}

/// Install the global subscriber. Safe to call once per process.
pub fn init_tracing(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(verbosity)));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(verbosity > 0)
        .with_filter(filter);
    tracing_subscriber::registry().with(fmt_layer).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_raises_local_level() {
        assert_eq!(default_directives(0), "warn,devp2p_sensor=info");
        assert_eq!(default_directives(1), "warn,devp2p_sensor=debug");
        assert_eq!(default_directives(9), "debug,devp2p_sensor=trace");
        assert!(EnvFilter::try_new(default_directives(2)).is_ok());
    }
}
