//! Execution-delegate boundary.
//!
//! The delegate is the external component that actually runs a requested
//! command. The bridge hands it an [`ExecHandle`](crate::handle::ExecHandle)
//! with the command-side conduit ends and expects exactly one completion
//! signal back. All delegate operations are asynchronous and may suspend for
//! the lifetime of a long-running command; the bridge never blocks its
//! per-channel event processing on them.

use async_trait::async_trait;
use thiserror::Error;

use crate::handle::ExecHandle;

/// Failure reported by a delegate, either from `start` or as the terminal
/// completion signal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("delegate failure: {reason}")]
pub struct DelegateError {
    reason: String,
}

impl DelegateError {
    /// Create a delegate error from a human-readable reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// The failure reason.
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// External command executor.
///
/// `start` may suspend until the command is ready to run (or fails to
/// start); its result is marshalled back onto the owning channel's event
/// loop before any state transition happens. The delegate is expected to
/// eventually invoke exactly one of the handle's completion operations.
#[async_trait]
pub trait ExecDelegate: Send + Sync {
    /// Begin executing `command`, reporting output and completion through
    /// `handle`. Returns an opaque context for the running command.
    async fn start(
        &self,
        command: &str,
        handle: ExecHandle,
    ) -> Result<Box<dyn ExecContext>, DelegateError>;

    /// Receive one environment variable for the invocation. May be called
    /// before or after `start`; last write per name wins.
    async fn set_env(&self, name: &str, value: &str);
}

/// Opaque context for one running command, owned by the delegate.
///
/// Both operations must be safe to call redundantly: `terminate` after
/// natural completion is a no-op, and a repeated `input_closed` carries no
/// additional meaning.
#[async_trait]
pub trait ExecContext: Send + Sync {
    /// Forcibly stop the command. Idempotent.
    async fn terminate(&self);

    /// Notification that no further input will arrive. One-shot,
    /// best-effort; failure does not abort the bridge.
    async fn input_closed(&self);
}
