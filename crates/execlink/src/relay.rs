//! Output relays: dedicated drain loops for the stdout and stderr conduits.
//!
//! Draining a conduit is a suspending read that cannot live on the channel's
//! event loop, so each output stream gets its own loop. Every chunk is
//! submitted back onto the channel's mailbox before it is framed, which
//! keeps outbound frames totally ordered relative to protocol events. The
//! two streams drain concurrently, so their interleaving with each other
//! stays unspecified.

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use execlink_core::{PipeReader, StreamTag};

use crate::handler::HandlerMsg;

/// Spawn the drain loop for one output conduit.
///
/// The loop runs until the conduit reaches end-of-stream or the `teardown`
/// signal fires; on teardown it closes its read end and drains what is
/// already buffered, so no produced bytes are lost. It deregisters itself by
/// submitting [`HandlerMsg::RelayFinished`] and never re-attaches. A failed
/// submission means the channel is gone, which is fatal for the invocation.
pub(crate) fn spawn_stream_relay(
    tag: StreamTag,
    mut reader: PipeReader,
    submit: mpsc::Sender<HandlerMsg>,
    mut teardown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                chunk = reader.read() => match chunk {
                    Some(bytes) => {
                        if bytes.is_empty() {
                            continue;
                        }
                        if submit
                            .send(HandlerMsg::Chunk { stream: tag, bytes })
                            .await
                            .is_err()
                        {
                            warn!(stream = ?tag, "channel event loop gone, aborting relay");
                            return;
                        }
                    }
                    None => break,
                },
                _ = teardown.changed() => {
                    // Stop accepting new writes, then drain buffered chunks.
                    reader.close();
                    while let Some(bytes) = reader.read().await {
                        if bytes.is_empty() {
                            continue;
                        }
                        if submit
                            .send(HandlerMsg::Chunk { stream: tag, bytes })
                            .await
                            .is_err()
                        {
                            warn!(stream = ?tag, "channel event loop gone, aborting relay");
                            return;
                        }
                    }
                    break;
                }
            }
        }
        if submit.send(HandlerMsg::RelayFinished(tag)).await.is_err() {
            debug!(stream = ?tag, "channel event loop gone before relay deregistration");
        }
    })
}
