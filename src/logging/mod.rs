//! Tracing subscriber setup for binaries embedding the engine.
//!
//! Libraries only emit `tracing` events; hosts that have no subscriber of
//! their own can call [`init_logging`] once at startup. `RUST_LOG` wins
//! over the passed default.

use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber filtered by `RUST_LOG`, falling back
/// to `default_level` (e.g. `"info"` or `"memsentinel=debug"`).
/// Returns an error string when a subscriber is already installed.
pub fn init_logging(default_level: &str) -> std::result::Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_init_reports_instead_of_panicking() {
        let first = init_logging("info");
        let second = init_logging("debug");
        // Exactly one of the two can win the global slot.
        assert!(first.is_ok() || second.is_err());
    }
}
