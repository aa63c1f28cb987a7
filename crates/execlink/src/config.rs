//! Bridge configuration.

/// Capacities for one exec channel's internal plumbing.
#[derive(Debug, Clone, Copy)]
pub struct BridgeConfig {
    /// Chunk capacity of each byte conduit. Bounds how far the command can
    /// run ahead of the channel before its writes suspend.
    pub pipe_capacity: usize,
    /// Capacity of the channel's event mailbox (protocol events plus
    /// marshalled continuations).
    pub mailbox_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            pipe_capacity: 32,
            mailbox_capacity: 64,
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_nonzero() {
        let config = BridgeConfig::default();
        assert!(config.pipe_capacity > 0);
        assert!(config.mailbox_capacity > 0);
    }
}
