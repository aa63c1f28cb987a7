//! Error types for the `execlink` core library.

use thiserror::Error;

/// Errors from conduit operations.
///
/// Post-close operations on a conduit end are a well-defined error, never a
/// panic: the writer side gets [`PipeError::Closed`], the reader side
/// observes end-of-stream.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PipeError {
    /// The conduit is closed; the chunk was not delivered.
    #[error("conduit closed")]
    Closed,
}
