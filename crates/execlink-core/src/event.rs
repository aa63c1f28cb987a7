//! Channel-level event and frame model for the exec bridge.
//!
//! These are the two closed sets of shapes crossing the boundary with the
//! outer protocol channel: inbound [`ChannelEvent`]s delivered in order by
//! the channel layer, and outbound [`OutboundFrame`]s the bridge writes back.
//! The wire framing of either direction belongs to the protocol layer, not
//! to this crate.

/// Which of the command's output streams a data frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamTag {
    /// Ordinary channel data (the command's standard output).
    Stdout,
    /// Error-stream-tagged channel data (the command's standard error).
    Stderr,
}

/// Inbound events delivered by the protocol channel, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Request to run a command. At most one per channel; a second request
    /// is a protocol violation.
    ExecRequest {
        /// The command text to execute.
        command: String,
        /// Whether the peer asked for a protocol-level reply.
        want_reply: bool,
    },
    /// An environment variable for the invocation. Zero or more, legal
    /// before or after the exec request; last write wins per name.
    EnvRequest {
        /// Variable name.
        name: String,
        /// Variable value.
        value: String,
    },
    /// Ordinary channel data destined for the command's standard input.
    Data(Vec<u8>),
    /// No further input will arrive (protocol half-close).
    InputClosed,
    /// The channel became inactive (e.g. the peer closed it).
    Inactive,
    /// A frame the channel layer could not map to any known event shape.
    /// Treated as a protocol violation by the bridge.
    Unrecognized {
        /// Raw frame type as seen on the wire.
        frame_type: u32,
    },
}

/// Outbound primitives the bridge writes onto the protocol channel.
///
/// The channel layer consumes these through a bounded sender; awaiting the
/// send is how the bridge honours the channel's flow control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Protocol-level success reply to the exec request.
    SuccessReply,
    /// Protocol-level failure reply to the exec request.
    FailureReply,
    /// A chunk of command output, tagged with its source stream.
    Data {
        /// Source stream of the bytes.
        stream: StreamTag,
        /// The bytes, verbatim.
        bytes: Vec<u8>,
    },
    /// Exit-status event carrying the command's exit code.
    ExitStatus(u32),
    /// Close the channel. Always the final frame for an invocation.
    Close,
}
