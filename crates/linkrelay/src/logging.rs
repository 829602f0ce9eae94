//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::RelayError;

/// Installs the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise `level` applies to linkrelay crates
/// and `warn` to everything else.
pub fn init(level: &str) -> Result<(), RelayError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| RelayError::Config(format!("logging already initialized: {e}")))
}

fn default_directives(level: &str) -> String {
    const CRATES: [&str; 7] = [
        "linkrelay",
        "linkrelay_transport",
        "linkrelay_protocol",
        "linkrelay_session",
        "linkrelay_store",
        "linkrelay_delivery",
        "linkrelay_retry",
    ];
    let mut directives = vec!["warn".to_string()];
    directives.extend(CRATES.iter().map(|c| format!("{c}={level}")));
    directives.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_cover_every_crate() {
        let d = default_directives("debug");
        assert!(d.starts_with("warn,"));
        assert!(d.contains("linkrelay_session=debug"));
        assert!(d.contains("linkrelay_store=debug"));
    }
}
