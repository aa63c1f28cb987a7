//! Exec channel handler: the per-channel orchestrator.
//!
//! Each exec channel is driven by one actor task that owns all channel state.
//! Protocol events and marshalled continuations (delegate start results,
//! completion signals, relayed output chunks) share a single mailbox, so the
//! actor is the channel's serial execution context: no two state transitions
//! ever run concurrently, no matter which domain produced them.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use execlink_core::{
    ChannelEvent, OutboundFrame, PipePair, PipeWriter, SessionIdentity, StreamTag,
};

use crate::config::BridgeConfig;
use crate::delegate::{DelegateError, ExecContext, ExecDelegate};
use crate::handle::{CompletionOutcome, ExecHandle};
use crate::relay::spawn_stream_relay;

/// Errors from driving an exec channel.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The channel's event loop has shut down; no more events are accepted.
    #[error("exec channel closed")]
    ChannelClosed,
}

/// Messages processed on a channel's serialized event loop.
pub(crate) enum HandlerMsg {
    /// An inbound protocol event, delivered in order by the channel layer.
    Event(ChannelEvent),
    /// The delegate's `start` resolved on its worker task.
    StartResolved(Result<Box<dyn ExecContext>, DelegateError>),
    /// The delegate's terminal completion signal.
    Completed(CompletionOutcome),
    /// One chunk drained from an output conduit.
    Chunk {
        stream: StreamTag,
        bytes: Vec<u8>,
    },
    /// An output relay drained its conduit to end-of-stream and deregistered.
    RelayFinished(StreamTag),
}

/// Per-exec-channel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Executing,
    AwaitingExit,
    Closing,
    Closed,
}

/// Client half of a spawned exec channel.
///
/// The embedding protocol layer feeds inbound events through [`event`] and
/// may await actor shutdown through [`closed`].
///
/// [`event`]: Self::event
/// [`closed`]: Self::closed
pub struct ExecChannelClient {
    event_tx: mpsc::Sender<HandlerMsg>,
    join: JoinHandle<()>,
}

impl ExecChannelClient {
    /// Inject one inbound channel event, in delivery order.
    ///
    /// Awaiting this send is how the protocol layer observes the channel's
    /// backpressure; it fails once the channel has closed.
    pub async fn event(&self, event: ChannelEvent) -> Result<(), BridgeError> {
        self.event_tx
            .send(HandlerMsg::Event(event))
            .await
            .map_err(|_| BridgeError::ChannelClosed)
    }

    /// Wait for the channel actor to finish.
    pub async fn closed(self) {
        drop(self.event_tx);
        if let Err(e) = self.join.await {
            debug!(error = %e, "exec channel task ended abnormally");
        }
    }
}

/// Spawns per-channel actors bridging exec requests to a delegate.
pub struct ExecChannelHandler;

impl ExecChannelHandler {
    /// Spawn the actor for one exec channel.
    ///
    /// `outbound` is the bounded sink for protocol frames; its backpressure
    /// is honoured by every outbound write. The returned client is the only
    /// way to feed the channel events.
    pub fn spawn<D>(
        identity: SessionIdentity,
        delegate: Arc<D>,
        outbound: mpsc::Sender<OutboundFrame>,
        config: BridgeConfig,
    ) -> ExecChannelClient
    where
        D: ExecDelegate + 'static,
    {
        let (tx, rx) = mpsc::channel(config.mailbox_capacity);
        let actor = ChannelActor {
            identity,
            delegate,
            outbound,
            config,
            msg_tx: tx.downgrade(),
            state: Lifecycle::Idle,
            env: HashMap::new(),
            env_forward: None,
            want_reply: false,
            reply_sent: false,
            start_pending: false,
            input_close_pending: false,
            input_closed_notified: false,
            suppress_output: false,
            stdin: None,
            context: None,
            teardown: None,
            pending_output: Vec::new(),
            relays_open: 0,
            outcome: None,
            exit_notifier: Arc::new(Mutex::new(None)),
        };
        let join = tokio::spawn(actor.run(rx));
        ExecChannelClient { event_tx: tx, join }
    }
}

struct ChannelActor {
    identity: SessionIdentity,
    delegate: Arc<dyn ExecDelegate>,
    outbound: mpsc::Sender<OutboundFrame>,
    config: BridgeConfig,
    /// Weak so the mailbox closes once the client and all in-flight workers
    /// are gone; strong senders are minted per invocation for the relays,
    /// the start worker and the reporting handle.
    msg_tx: mpsc::WeakSender<HandlerMsg>,
    state: Lifecycle,
    /// Channel-scoped environment accumulation, last write per name wins.
    /// Each assignment is also forwarded to the delegate as it arrives.
    env: HashMap<String, String>,
    /// Lazily-started sequential forwarder delivering env assignments to
    /// the delegate in arrival order.
    env_forward: Option<mpsc::Sender<(String, String)>>,
    want_reply: bool,
    reply_sent: bool,
    start_pending: bool,
    input_close_pending: bool,
    input_closed_notified: bool,
    /// Set once a start failure makes further data frames illegal.
    suppress_output: bool,
    stdin: Option<PipeWriter>,
    context: Option<Arc<dyn ExecContext>>,
    teardown: Option<watch::Sender<bool>>,
    /// Output buffered until the start outcome is known, so a reply (when
    /// requested) always precedes data frames.
    pending_output: Vec<(StreamTag, Vec<u8>)>,
    relays_open: u8,
    outcome: Option<CompletionOutcome>,
    exit_notifier: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl ChannelActor {
    async fn run(mut self, mut rx: mpsc::Receiver<HandlerMsg>) {
        while let Some(msg) = rx.recv().await {
            if self.handle_msg(msg).await.is_break() {
                break;
            }
        }
        self.state = Lifecycle::Closed;
        debug!(session_id = %self.identity.session_id(), "exec channel event loop finished");
    }

    async fn handle_msg(&mut self, msg: HandlerMsg) -> ControlFlow<()> {
        match msg {
            HandlerMsg::Event(event) => self.handle_event(event).await,
            HandlerMsg::StartResolved(result) => self.handle_start_resolved(result).await,
            HandlerMsg::Completed(outcome) => self.handle_completed(outcome).await,
            HandlerMsg::Chunk { stream, bytes } => self.handle_chunk(stream, bytes).await,
            HandlerMsg::RelayFinished(tag) => {
                debug!(
                    session_id = %self.identity.session_id(),
                    stream = ?tag,
                    "output relay finished"
                );
                self.relays_open = self.relays_open.saturating_sub(1);
                self.try_finish().await
            }
        }
    }

    async fn handle_event(&mut self, event: ChannelEvent) -> ControlFlow<()> {
        match event {
            ChannelEvent::ExecRequest {
                command,
                want_reply,
            } => self.handle_exec_request(command, want_reply).await,
            ChannelEvent::EnvRequest { name, value } => {
                // Legal before or after the exec request; forwarded
                // regardless of state. All forwards go through one ordered
                // queue so same-name assignments reach the delegate in
                // arrival order (last write wins observably).
                self.env.insert(name.clone(), value.clone());
                let forward = self.env_forwarder();
                if forward.send((name, value)).await.is_err() {
                    debug!(
                        session_id = %self.identity.session_id(),
                        "env forwarder gone, dropping assignment"
                    );
                }
                ControlFlow::Continue(())
            }
            ChannelEvent::Data(bytes) => self.handle_data(bytes).await,
            ChannelEvent::InputClosed => {
                if let Some(stdin) = self.stdin.as_mut() {
                    stdin.close();
                }
                self.notify_input_closed();
                ControlFlow::Continue(())
            }
            ChannelEvent::Inactive => self.handle_inactive(),
            ChannelEvent::Unrecognized { frame_type } => {
                warn!(
                    session_id = %self.identity.session_id(),
                    frame_type,
                    "unrecognized frame on exec channel, tearing down"
                );
                self.abort_channel().await
            }
        }
    }

    async fn handle_exec_request(
        &mut self,
        command: String,
        want_reply: bool,
    ) -> ControlFlow<()> {
        if self.state != Lifecycle::Idle {
            warn!(
                session_id = %self.identity.session_id(),
                state = ?self.state,
                "second exec request on channel, tearing down"
            );
            if want_reply {
                let _ = self.send_frame(OutboundFrame::FailureReply).await;
            }
            return self.abort_channel().await;
        }

        info!(
            session_id = %self.identity.session_id(),
            command = %command,
            want_reply,
            env_vars = self.env.len(),
            "exec request accepted"
        );
        self.want_reply = want_reply;
        self.state = Lifecycle::Executing;
        self.start_pending = true;

        let (bridge_ends, command_ends) = PipePair::new(self.config.pipe_capacity);
        self.stdin = Some(bridge_ends.stdin);

        let (teardown_tx, teardown_rx) = watch::channel(false);
        self.teardown = Some(teardown_tx);

        let Some(submit) = self.msg_tx.upgrade() else {
            // The client dropped with this request still buffered. The peer
            // must still see a definitive answer, not silence.
            warn!(
                session_id = %self.identity.session_id(),
                "channel winding down, rejecting buffered exec request"
            );
            if want_reply {
                let _ = self.send_frame(OutboundFrame::FailureReply).await;
            }
            return self.abort_channel().await;
        };
        self.relays_open = 2;
        spawn_stream_relay(
            StreamTag::Stdout,
            bridge_ends.stdout,
            submit.clone(),
            teardown_rx.clone(),
        );
        spawn_stream_relay(
            StreamTag::Stderr,
            bridge_ends.stderr,
            submit.clone(),
            teardown_rx,
        );

        let handle = ExecHandle::new(
            self.identity.clone(),
            command_ends,
            submit.clone(),
            Arc::clone(&self.exit_notifier),
        );
        let delegate = Arc::clone(&self.delegate);
        tokio::spawn(async move {
            let result = delegate.start(&command, handle).await;
            if let Err(rejected) = submit.send(HandlerMsg::StartResolved(result)).await {
                debug!("channel gone before delegate start resolved");
                // Nothing can drive this invocation any more; stop the
                // command so it does not outlive the channel.
                if let HandlerMsg::StartResolved(Ok(ctx)) = rejected.0 {
                    ctx.terminate().await;
                }
            }
        });
        ControlFlow::Continue(())
    }

    async fn handle_data(&mut self, bytes: Vec<u8>) -> ControlFlow<()> {
        if self.state != Lifecycle::Executing {
            warn!(
                session_id = %self.identity.session_id(),
                state = ?self.state,
                len = bytes.len(),
                "dropping channel data outside executing state"
            );
            return ControlFlow::Continue(());
        }
        match self.stdin.as_ref() {
            // Awaiting the conduit write is the stdin-side backpressure: the
            // event loop pauses instead of buffering unboundedly.
            Some(stdin) => {
                if let Err(e) = stdin.write(bytes).await {
                    debug!(
                        session_id = %self.identity.session_id(),
                        error = %e,
                        "input conduit closed, dropping data"
                    );
                }
            }
            None => {
                debug!(
                    session_id = %self.identity.session_id(),
                    "input already closed, dropping data"
                );
            }
        }
        ControlFlow::Continue(())
    }

    fn handle_inactive(&mut self) -> ControlFlow<()> {
        info!(
            session_id = %self.identity.session_id(),
            state = ?self.state,
            "channel inactive"
        );
        if let Some(ctx) = self.context.take() {
            tokio::spawn(async move {
                ctx.terminate().await;
            });
        }
        // Remaining references (pipes, teardown signal) drop with the actor;
        // a late completion signal then finds the mailbox gone and is
        // silently discarded.
        self.state = Lifecycle::Closed;
        ControlFlow::Break(())
    }

    async fn handle_start_resolved(
        &mut self,
        result: Result<Box<dyn ExecContext>, DelegateError>,
    ) -> ControlFlow<()> {
        self.start_pending = false;
        match result {
            Ok(ctx) => {
                self.context = Some(Arc::from(ctx));
                if self.want_reply && !self.reply_sent {
                    self.reply_sent = true;
                    if self.send_frame(OutboundFrame::SuccessReply).await.is_err() {
                        return self.fatal_close("success reply rejected, channel gone");
                    }
                }
                // Flush output held back while the start outcome was unknown.
                for (stream, bytes) in std::mem::take(&mut self.pending_output) {
                    if self
                        .send_frame(OutboundFrame::Data { stream, bytes })
                        .await
                        .is_err()
                    {
                        return self.fatal_close("outbound data rejected, channel gone");
                    }
                }
                if self.input_close_pending {
                    self.input_close_pending = false;
                    self.notify_input_closed();
                }
                info!(session_id = %self.identity.session_id(), "delegate started");
                self.try_finish().await
            }
            Err(e) => {
                warn!(
                    session_id = %self.identity.session_id(),
                    error = %e,
                    "delegate failed to start"
                );
                self.close_pipes();
                // No data frames may follow a failed start: the buffered
                // output is dropped and anything the relays drain during
                // teardown is discarded too.
                self.pending_output.clear();
                self.suppress_output = true;
                if self.outcome.is_none() {
                    self.outcome = Some(CompletionOutcome::Failure(e));
                }
                self.state = Lifecycle::AwaitingExit;
                self.fire_exit_notifier().await;
                self.try_finish().await
            }
        }
    }

    async fn handle_completed(&mut self, outcome: CompletionOutcome) -> ControlFlow<()> {
        if self.state == Lifecycle::Idle {
            warn!(
                session_id = %self.identity.session_id(),
                "completion signal with no exec in flight, ignoring"
            );
            return ControlFlow::Continue(());
        }
        if self.outcome.is_some() {
            warn!(
                session_id = %self.identity.session_id(),
                "duplicate completion signal ignored"
            );
            return ControlFlow::Continue(());
        }
        debug!(
            session_id = %self.identity.session_id(),
            outcome = ?outcome,
            "completion signal received"
        );
        self.outcome = Some(outcome);
        // Close the pipe pair unconditionally, success or failure.
        self.close_pipes();
        if self.state == Lifecycle::Executing {
            self.state = Lifecycle::AwaitingExit;
        }
        self.fire_exit_notifier().await;
        self.try_finish().await
    }

    /// Exit notification is best-effort and fires once, when the terminal
    /// outcome is first recorded (delegate completion or start failure).
    async fn fire_exit_notifier(&self) {
        if let Some(tx) = self.exit_notifier.lock().await.take() {
            let _ = tx.send(());
        }
    }

    async fn handle_chunk(&mut self, stream: StreamTag, bytes: Vec<u8>) -> ControlFlow<()> {
        if self.suppress_output {
            debug!(
                session_id = %self.identity.session_id(),
                stream = ?stream,
                len = bytes.len(),
                "discarding output after failed start"
            );
            return ControlFlow::Continue(());
        }
        if self.start_pending {
            self.pending_output.push((stream, bytes));
            return ControlFlow::Continue(());
        }
        if self
            .send_frame(OutboundFrame::Data { stream, bytes })
            .await
            .is_err()
        {
            return self.fatal_close("outbound data rejected, channel gone");
        }
        ControlFlow::Continue(())
    }

    /// Run the close/reply sequence once the invocation is fully drained:
    /// start resolved, both relays deregistered, terminal outcome known.
    async fn try_finish(&mut self) -> ControlFlow<()> {
        if self.start_pending || self.relays_open > 0 || self.state != Lifecycle::AwaitingExit {
            return ControlFlow::Continue(());
        }
        let Some(outcome) = self.outcome.clone() else {
            return ControlFlow::Continue(());
        };
        self.state = Lifecycle::Closing;
        match outcome {
            CompletionOutcome::Success(code) => {
                if self.want_reply && !self.reply_sent {
                    self.reply_sent = true;
                    let _ = self.send_frame(OutboundFrame::SuccessReply).await;
                }
                // Exit status goes out strictly after pipe-pair closure.
                if self.send_frame(OutboundFrame::ExitStatus(code)).await.is_err() {
                    warn!(
                        session_id = %self.identity.session_id(),
                        "exit status rejected, falling back to failure close"
                    );
                    if self.want_reply && !self.reply_sent {
                        self.reply_sent = true;
                        let _ = self.send_frame(OutboundFrame::FailureReply).await;
                    }
                } else {
                    info!(
                        session_id = %self.identity.session_id(),
                        exit_code = code,
                        "exec completed"
                    );
                }
            }
            CompletionOutcome::Failure(e) => {
                info!(
                    session_id = %self.identity.session_id(),
                    error = %e,
                    "exec failed"
                );
                if self.want_reply && !self.reply_sent {
                    self.reply_sent = true;
                    let _ = self.send_frame(OutboundFrame::FailureReply).await;
                }
            }
        }
        let _ = self.send_frame(OutboundFrame::Close).await;
        self.state = Lifecycle::Closed;
        ControlFlow::Break(())
    }

    fn env_forwarder(&mut self) -> mpsc::Sender<(String, String)> {
        if let Some(tx) = &self.env_forward {
            return tx.clone();
        }
        let (tx, mut rx) = mpsc::channel::<(String, String)>(self.config.mailbox_capacity);
        let delegate = Arc::clone(&self.delegate);
        tokio::spawn(async move {
            while let Some((name, value)) = rx.recv().await {
                delegate.set_env(&name, &value).await;
            }
        });
        self.env_forward = Some(tx.clone());
        tx
    }

    fn notify_input_closed(&mut self) {
        if self.input_closed_notified {
            return;
        }
        if let Some(ctx) = self.context.as_ref() {
            self.input_closed_notified = true;
            let ctx = Arc::clone(ctx);
            // Best-effort one-shot; never awaited by the main flow.
            tokio::spawn(async move {
                ctx.input_closed().await;
            });
        } else if self.start_pending {
            self.input_close_pending = true;
        }
    }

    async fn abort_channel(&mut self) -> ControlFlow<()> {
        if let Some(ctx) = self.context.take() {
            tokio::spawn(async move {
                ctx.terminate().await;
            });
        }
        self.close_pipes();
        let _ = self.send_frame(OutboundFrame::Close).await;
        self.state = Lifecycle::Closed;
        ControlFlow::Break(())
    }

    fn fatal_close(&mut self, reason: &'static str) -> ControlFlow<()> {
        warn!(
            session_id = %self.identity.session_id(),
            reason,
            "closing exec channel"
        );
        if let Some(ctx) = self.context.take() {
            tokio::spawn(async move {
                ctx.terminate().await;
            });
        }
        self.close_pipes();
        self.state = Lifecycle::Closed;
        ControlFlow::Break(())
    }

    fn close_pipes(&mut self) {
        if let Some(stdin) = self.stdin.as_mut() {
            stdin.close();
        }
        if let Some(teardown) = self.teardown.take() {
            let _ = teardown.send(true);
        }
    }

    async fn send_frame(&self, frame: OutboundFrame) -> Result<(), BridgeError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| BridgeError::ChannelClosed)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    struct NeverStarts;

    #[async_trait::async_trait]
    impl ExecDelegate for NeverStarts {
        async fn start(
            &self,
            _command: &str,
            _handle: ExecHandle,
        ) -> Result<Box<dyn ExecContext>, DelegateError> {
            Err(DelegateError::new("refused"))
        }

        async fn set_env(&self, _name: &str, _value: &str) {}
    }

    fn spawn_with(delegate: Arc<NeverStarts>) -> (ExecChannelClient, mpsc::Receiver<OutboundFrame>) {
        let (out_tx, out_rx) = mpsc::channel(8);
        let client = ExecChannelHandler::spawn(
            SessionIdentity::new(None, None),
            delegate,
            out_tx,
            BridgeConfig::default(),
        );
        (client, out_rx)
    }

    #[tokio::test]
    async fn inactive_while_idle_closes_without_frames() {
        let (client, mut out_rx) = spawn_with(Arc::new(NeverStarts));

        client.event(ChannelEvent::Inactive).await.unwrap();
        client.closed().await;

        assert!(out_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn data_before_exec_request_is_dropped() {
        let (client, mut out_rx) = spawn_with(Arc::new(NeverStarts));

        client
            .event(ChannelEvent::Data(b"stray".to_vec()))
            .await
            .unwrap();
        client.event(ChannelEvent::Inactive).await.unwrap();
        client.closed().await;

        assert!(out_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn exec_request_buffered_past_client_drop_is_still_answered() {
        let (client, mut out_rx) = spawn_with(Arc::new(NeverStarts));

        // The request sits in the mailbox while the client is torn down;
        // the peer must still get a definitive answer plus a close.
        client
            .event(ChannelEvent::ExecRequest {
                command: "late".into(),
                want_reply: true,
            })
            .await
            .unwrap();
        client.closed().await;

        assert!(matches!(out_rx.recv().await, Some(OutboundFrame::FailureReply)));
        assert!(matches!(out_rx.recv().await, Some(OutboundFrame::Close)));
        assert!(out_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn unrecognized_frame_tears_channel_down() {
        let (client, mut out_rx) = spawn_with(Arc::new(NeverStarts));

        client
            .event(ChannelEvent::Unrecognized { frame_type: 99 })
            .await
            .unwrap();
        client.closed().await;

        assert!(matches!(out_rx.recv().await, Some(OutboundFrame::Close)));
        assert!(out_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn failed_start_sends_failure_reply_then_close() {
        let (client, mut out_rx) = spawn_with(Arc::new(NeverStarts));

        client
            .event(ChannelEvent::ExecRequest {
                command: "whoami".into(),
                want_reply: true,
            })
            .await
            .unwrap();

        assert!(matches!(out_rx.recv().await, Some(OutboundFrame::FailureReply)));
        assert!(matches!(out_rx.recv().await, Some(OutboundFrame::Close)));
        assert!(out_rx.recv().await.is_none());
        client.closed().await;
    }

    #[tokio::test]
    async fn failed_start_without_reply_request_sends_only_close() {
        let (client, mut out_rx) = spawn_with(Arc::new(NeverStarts));

        client
            .event(ChannelEvent::ExecRequest {
                command: "whoami".into(),
                want_reply: false,
            })
            .await
            .unwrap();

        assert!(matches!(out_rx.recv().await, Some(OutboundFrame::Close)));
        assert!(out_rx.recv().await.is_none());
        client.closed().await;
    }
}
