//! Output-reporting handle passed to the execution delegate.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, warn};

use execlink_core::{CommandEnds, PipeReader, PipeWriter, SessionIdentity};

use crate::delegate::DelegateError;
use crate::handler::HandlerMsg;

/// Terminal outcome of one exec invocation, reported by the delegate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// The command ran and exited with this code.
    Success(u32),
    /// The command failed; no exit status will be reported to the peer.
    Failure(DelegateError),
}

/// Handle through which a delegate reports command output and completion.
///
/// Created once per exec invocation. Carries the command-side conduit ends,
/// the session identity for attribution, and a single-use completion slot:
/// exactly one of [`succeed`](Self::succeed) or [`fail`](Self::fail) must be
/// invoked exactly once. The first signal is authoritative; later ones are
/// ignored.
pub struct ExecHandle {
    identity: SessionIdentity,
    stdin: Mutex<Option<PipeReader>>,
    stdout: Mutex<Option<PipeWriter>>,
    stderr: Mutex<Option<PipeWriter>>,
    completion: Mutex<Option<mpsc::Sender<HandlerMsg>>>,
    notifier: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl ExecHandle {
    pub(crate) fn new(
        identity: SessionIdentity,
        ends: CommandEnds,
        completion_tx: mpsc::Sender<HandlerMsg>,
        notifier: Arc<Mutex<Option<oneshot::Sender<()>>>>,
    ) -> Self {
        Self {
            identity,
            stdin: Mutex::new(Some(ends.stdin)),
            stdout: Mutex::new(Some(ends.stdout)),
            stderr: Mutex::new(Some(ends.stderr)),
            completion: Mutex::new(Some(completion_tx)),
            notifier,
        }
    }

    /// Identity of the session this invocation belongs to.
    pub const fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    /// Take the read end of the input conduit. Yields `Some` exactly once.
    pub async fn take_stdin(&self) -> Option<PipeReader> {
        self.stdin.lock().await.take()
    }

    /// Take the write end of the output conduit. Yields `Some` exactly once.
    pub async fn take_stdout(&self) -> Option<PipeWriter> {
        self.stdout.lock().await.take()
    }

    /// Take the write end of the error conduit. Yields `Some` exactly once.
    pub async fn take_stderr(&self) -> Option<PipeWriter> {
        self.stderr.lock().await.take()
    }

    /// Register a callback fired after the bridge consumes the terminal
    /// signal. Best-effort; intended for delegate-side cleanup only.
    pub async fn notify_on_completion(&self, tx: oneshot::Sender<()>) {
        *self.notifier.lock().await = Some(tx);
    }

    /// Report that the command completed with `exit_code`.
    pub async fn succeed(&self, exit_code: u32) {
        self.complete(CompletionOutcome::Success(exit_code)).await;
    }

    /// Report that the command failed.
    pub async fn fail(&self, error: DelegateError) {
        self.complete(CompletionOutcome::Failure(error)).await;
    }

    async fn complete(&self, outcome: CompletionOutcome) {
        let Some(tx) = self.completion.lock().await.take() else {
            warn!(
                session_id = %self.identity.session_id(),
                "duplicate completion signal ignored"
            );
            return;
        };
        if tx.send(HandlerMsg::Completed(outcome)).await.is_err() {
            // Channel already torn down (e.g. peer closed mid-execution);
            // a late completion must not emit further protocol frames.
            debug!(
                session_id = %self.identity.session_id(),
                "channel gone before completion signal was delivered"
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use execlink_core::PipePair;

    fn test_handle() -> (ExecHandle, mpsc::Receiver<HandlerMsg>) {
        let (_bridge, command) = PipePair::new(8);
        let (tx, rx) = mpsc::channel(8);
        let handle = ExecHandle::new(
            SessionIdentity::new(None, None),
            command,
            tx,
            Arc::new(Mutex::new(None)),
        );
        (handle, rx)
    }

    #[tokio::test]
    async fn succeed_delivers_exactly_one_completion() {
        let (handle, mut rx) = test_handle();

        handle.succeed(0).await;
        handle.succeed(1).await; // ignored, first signal is authoritative
        drop(handle);

        assert!(matches!(
            rx.recv().await,
            Some(HandlerMsg::Completed(CompletionOutcome::Success(0)))
        ));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn fail_after_succeed_is_ignored() {
        let (handle, mut rx) = test_handle();

        handle.succeed(7).await;
        handle.fail(DelegateError::new("too late")).await;
        drop(handle);

        assert!(matches!(
            rx.recv().await,
            Some(HandlerMsg::Completed(CompletionOutcome::Success(7)))
        ));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn late_completion_after_channel_teardown_does_not_panic() {
        let (handle, rx) = test_handle();
        drop(rx);

        // Must be a silent no-op, not a crash.
        handle.succeed(0).await;
    }

    #[tokio::test]
    async fn conduit_ends_are_taken_exactly_once() {
        let (handle, _rx) = test_handle();

        assert!(handle.take_stdin().await.is_some());
        assert!(handle.take_stdin().await.is_none());
        assert!(handle.take_stdout().await.is_some());
        assert!(handle.take_stdout().await.is_none());
        assert!(handle.take_stderr().await.is_some());
        assert!(handle.take_stderr().await.is_none());
    }
}
