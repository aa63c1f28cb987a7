//! Exec-channel bridge.
//!
//! Bridges one exec-request channel of a multiplexed session protocol to an
//! external command executor: inbound channel data becomes the command's
//! stdin, the command's stdout and stderr come back as tagged data frames,
//! and exactly one exit status or failure reply closes the channel.
//!
//! The embedding protocol layer spawns one [`ExecChannelHandler`] per
//! channel and feeds it decoded [`ChannelEvent`]s through the returned
//! [`ExecChannelClient`]; command execution itself is behind the
//! [`ExecDelegate`] trait.
//!
//! [`ChannelEvent`]: execlink_core::ChannelEvent

pub mod config;
pub mod delegate;
pub mod handle;
pub(crate) mod handler;
pub(crate) mod relay;

pub use execlink_core::{
    ChannelEvent, OutboundFrame, PipeReader, PipeWriter, SessionIdentity, StreamTag,
};

pub use config::BridgeConfig;
pub use delegate::{DelegateError, ExecContext, ExecDelegate};
pub use handle::{CompletionOutcome, ExecHandle};
pub use handler::{BridgeError, ExecChannelClient, ExecChannelHandler};
