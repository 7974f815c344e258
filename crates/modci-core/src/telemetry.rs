//! Tracing initialisation for modci binaries.
//!
//! Without `RUST_LOG`, modci's own crates log at the requested level and
//! everything else (SurrealDB, redis, reqwest, hyper) at `warn`.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const MODCI_TARGETS: [&str; 3] = ["modci", "modci_core", "modci_state"];

/// Filter directives used when `RUST_LOG` is not set.
pub fn default_directives(level: Level) -> String {
    let level = level.as_str().to_ascii_lowercase();
    std::iter::once("warn".to_string())
        .chain(MODCI_TARGETS.iter().map(|target| format!("{target}={level}")))
        .collect::<Vec<_>>()
        .join(",")
}

/// Install the global subscriber. Only the first call in a process takes
/// effect.
///
/// `json` switches to newline-delimited JSON with event targets.
pub fn init_tracing(json: bool, level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

    let installed = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact().with_target(false))
            .try_init()
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_scope_modci_crates() {
        assert_eq!(
            default_directives(Level::DEBUG),
            "warn,modci=debug,modci_core=debug,modci_state=debug"
        );
        assert!(EnvFilter::try_new(default_directives(Level::INFO)).is_ok());
    }

    #[test]
    fn test_init_tracing_twice_is_harmless() {
        init_tracing(false, Level::DEBUG);
        init_tracing(true, Level::INFO);
        tracing::info!("still logging");
    }
}
