//! Tracing setup for binaries and tests embedding the bridge.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence; `default_filter` applies when it is unset or
/// unparsable (e.g. `"execlink=info"`). With `log_json` the output is
/// structured JSON lines instead of the human-readable format.
///
/// Calling this again once a subscriber is installed is a no-op, so test
/// harnesses can invoke it unconditionally.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let registry = tracing_subscriber::registry().with(filter);
    let _ = if log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn repeated_initialisation_is_a_no_op() {
        init_tracing("execlink=info", false);
        init_tracing("execlink=debug", true);
    }
}
