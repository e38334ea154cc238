//! Logging bootstrap for binaries and local runs.

use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "campus_agents=info,warn";

fn default_filter(debug: bool) -> EnvFilter {
    if debug {
        EnvFilter::new("campus_agents=debug,info")
    } else {
        EnvFilter::new(DEFAULT_FILTER)
    }
}

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to the
/// crate default. Returns `false` if a global subscriber was already set.
pub fn init_tracing(debug: bool) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(debug)))
        .with_target(false)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_harmless() {
        init_tracing(false);
        assert!(!init_tracing(true));
    }
}
