//! Byte conduits shared between the channel bridge and the execution delegate.
//!
//! Each conduit is a bounded byte-chunk channel with exactly one writer and
//! one reader. Which side of the bridge plays which role differs per stream:
//! the bridge writes stdin and reads stdout/stderr; the command does the
//! opposite. Closing either end is idempotent, and chunks buffered before a
//! close are still drained by the reader before it observes end-of-stream.

use tokio::sync::mpsc;

use crate::error::PipeError;

/// Write end of a conduit.
///
/// Writes apply backpressure through the bounded channel: when the reader is
/// behind, `write` suspends instead of buffering unboundedly.
#[derive(Debug)]
pub struct PipeWriter {
    tx: Option<mpsc::Sender<Vec<u8>>>,
}

impl PipeWriter {
    /// Write one chunk to the conduit.
    ///
    /// Returns [`PipeError::Closed`] if either end has been closed.
    pub async fn write(&self, bytes: Vec<u8>) -> Result<(), PipeError> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(PipeError::Closed);
        };
        tx.send(bytes).await.map_err(|_| PipeError::Closed)
    }

    /// Close the write end. Idempotent.
    ///
    /// The paired reader drains already-buffered chunks, then observes
    /// end-of-stream.
    pub fn close(&mut self) {
        self.tx.take();
    }

    /// Whether this conduit can still accept writes.
    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().is_none_or(mpsc::Sender::is_closed)
    }
}

/// Read end of a conduit.
#[derive(Debug)]
pub struct PipeReader {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl PipeReader {
    /// Read the next chunk, suspending until one is available.
    ///
    /// Returns `None` once the write end is closed and all buffered chunks
    /// have been drained.
    pub async fn read(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Close the read end. Idempotent.
    ///
    /// Further writes fail with [`PipeError::Closed`], but chunks already
    /// buffered remain readable until end-of-stream.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

fn conduit(capacity: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(capacity);
    (PipeWriter { tx: Some(tx) }, PipeReader { rx })
}

/// The conduit ends held by the channel bridge for one exec invocation.
#[derive(Debug)]
pub struct BridgeEnds {
    /// Write end of the input conduit (inbound channel data goes here).
    pub stdin: PipeWriter,
    /// Read end of the output conduit.
    pub stdout: PipeReader,
    /// Read end of the error conduit.
    pub stderr: PipeReader,
}

/// The conduit ends handed to the execution delegate's command.
#[derive(Debug)]
pub struct CommandEnds {
    /// Read end of the input conduit.
    pub stdin: PipeReader,
    /// Write end of the output conduit.
    pub stdout: PipeWriter,
    /// Write end of the error conduit.
    pub stderr: PipeWriter,
}

/// Allocator for the three conduits of one exec invocation.
///
/// Conduits are never reused across invocations; allocate a fresh pair per
/// exec request.
pub struct PipePair;

impl PipePair {
    /// Allocate the stdin/stdout/stderr conduits, split into the bridge-side
    /// and command-side halves.
    pub fn new(capacity: usize) -> (BridgeEnds, CommandEnds) {
        let (stdin_w, stdin_r) = conduit(capacity);
        let (stdout_w, stdout_r) = conduit(capacity);
        let (stderr_w, stderr_r) = conduit(capacity);
        (
            BridgeEnds {
                stdin: stdin_w,
                stdout: stdout_r,
                stderr: stderr_r,
            },
            CommandEnds {
                stdin: stdin_r,
                stdout: stdout_w,
                stderr: stderr_w,
            },
        )
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_preserves_bytes_and_order() {
        let (mut bridge, mut command) = PipePair::new(8);

        bridge.stdin.write(b"hello ".to_vec()).await.unwrap();
        bridge.stdin.write(b"world".to_vec()).await.unwrap();

        assert_eq!(command.stdin.read().await, Some(b"hello ".to_vec()));
        assert_eq!(command.stdin.read().await, Some(b"world".to_vec()));
    }

    #[tokio::test]
    async fn close_drains_buffered_chunks_before_eof() {
        let (mut bridge, mut command) = PipePair::new(8);

        command.stdout.write(b"late output".to_vec()).await.unwrap();
        command.stdout.close();

        assert_eq!(bridge.stdout.read().await, Some(b"late output".to_vec()));
        assert_eq!(bridge.stdout.read().await, None);
    }

    #[tokio::test]
    async fn writer_close_is_idempotent() {
        let (mut bridge, mut command) = PipePair::new(8);

        bridge.stdin.close();
        bridge.stdin.close();

        assert!(bridge.stdin.is_closed());
        assert_eq!(command.stdin.read().await, None);
    }

    #[tokio::test]
    async fn write_after_close_is_an_error_not_a_panic() {
        let (mut bridge, _command) = PipePair::new(8);

        bridge.stdin.close();
        let err = bridge.stdin.write(b"dropped".to_vec()).await.unwrap_err();
        assert_eq!(err, PipeError::Closed);
    }

    #[tokio::test]
    async fn reader_close_rejects_new_writes_but_keeps_buffered() {
        let (mut bridge, mut command) = PipePair::new(8);

        command.stderr.write(b"buffered".to_vec()).await.unwrap();
        bridge.stderr.close();
        bridge.stderr.close();

        let err = command.stderr.write(b"rejected".to_vec()).await.unwrap_err();
        assert_eq!(err, PipeError::Closed);

        assert_eq!(bridge.stderr.read().await, Some(b"buffered".to_vec()));
        assert_eq!(bridge.stderr.read().await, None);
    }

    #[tokio::test]
    async fn dropping_command_half_closes_all_three_from_bridge_view() {
        let (mut bridge, command) = PipePair::new(8);
        drop(command);

        assert!(bridge.stdin.is_closed());
        assert_eq!(bridge.stdout.read().await, None);
        assert_eq!(bridge.stderr.read().await, None);
    }
}
