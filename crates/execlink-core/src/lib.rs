//! `execlink` Core Library
//!
//! Shared leaf types for the exec-channel bridge:
//! - Byte conduits (stdin/stdout/stderr) with idempotent close semantics
//! - Channel event and outbound frame model
//! - Session identity for attribution
//! - Tracing initialisation helper

pub mod error;
pub mod event;
pub mod identity;
pub mod pipe;
pub mod tracing_init;

pub use error::PipeError;
pub use event::{ChannelEvent, OutboundFrame, StreamTag};
pub use identity::SessionIdentity;
pub use pipe::{BridgeEnds, CommandEnds, PipePair, PipeReader, PipeWriter};
