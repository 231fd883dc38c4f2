//! Bidirectional message channels between cooperating processes.
//!
//! A [`Channel`] wraps any async byte stream pair (child stdio, our own
//! stdin/stdout, an in-memory duplex) and carries [`Message`]s framed as one
//! JSON object per line.
//!
//! # Reading
//!
//! Each channel owns a small pump task that decodes incoming lines into an
//! inbox. This makes readiness observable without consuming anything, so
//! [`wait_any`] can multiplex a whole set of channels and never miss a message
//! that arrived before it was called.
//!
//! ```text
//!   peer ──bytes──► pump task ──Message──► inbox ──► read() / wait_any()
//!   peer ◄─bytes── write() ◄─────────────────────── caller
//! ```
//!
//! End-of-stream is reported as `None` from [`Channel::read`], never as an
//! error.

use std::future::poll_fn;
use std::io::ErrorKind;
use std::task::{Context, Poll};

use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::LinesStream;
use tracing::{debug, warn};

use crate::protocol::Message;

/// Buffer size of each direction of an in-memory channel pair.
const DUPLEX_BUFFER: usize = 64 * 1024;

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Errors that can occur while writing to a channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The peer has gone away, or this end was already closed.
    #[error("channel to {0} is broken")]
    Broken(String),

    /// The message could not be serialized.
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    /// Any other transport failure.
    #[error("channel I/O error: {0}")]
    Io(#[from] std::io::Error),
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One end of an established message pipe.
pub struct Channel {
    label: String,
    writer: Option<BoxedWriter>,
    inbox: mpsc::UnboundedReceiver<Message>,
    /// A message (or end-of-stream) observed by [`wait_any`] but not yet read.
    pending: Option<Option<Message>>,
    pump: JoinHandle<()>,
}

impl Channel {
    /// Wraps a reader/writer pair into a channel.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<R, W>(label: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let label = label.into();
        let (tx, inbox) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump(label.clone(), reader, tx));

        Self {
            label,
            writer: Some(Box::new(writer)),
            inbox,
            pending: None,
            pump,
        }
    }

    /// Creates a connected pair of in-memory channels.
    ///
    /// Whatever one end writes, the other end reads, independently in each
    /// direction.
    ///
    /// # Example
    ///
    /// ```
    /// use nitra::channel::Channel;
    /// use nitra::protocol::Message;
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() -> anyhow::Result<()> {
    /// let (mut master, mut runner) = Channel::open();
    /// runner.write(&Message::Next).await?;
    /// assert_eq!(master.read().await, Some(Message::Next));
    /// # Ok(())
    /// # }
    /// ```
    pub fn open() -> (Channel, Channel) {
        let (left, right) = tokio::io::duplex(DUPLEX_BUFFER);
        let (left_read, left_write) = tokio::io::split(left);
        let (right_read, right_write) = tokio::io::split(right);

        (
            Channel::new("pipe:left", left_read, left_write),
            Channel::new("pipe:right", right_read, right_write),
        )
    }

    /// Renames the channel; the label only shows up in diagnostics.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Returns the diagnostic label of this channel.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Sends one complete message.
    ///
    /// Fails with [`ChannelError::Broken`] if the peer's read end is gone or
    /// this end has been closed.
    pub async fn write(&mut self, message: &Message) -> ChannelResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| ChannelError::Broken(self.label.clone()))?;

        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');

        let written = async {
            writer.write_all(&line).await?;
            writer.flush().await
        }
        .await;

        match written {
            Ok(()) => Ok(()),
            Err(e) if is_disconnect(&e) => Err(ChannelError::Broken(self.label.clone())),
            Err(e) => Err(ChannelError::Io(e)),
        }
    }

    /// Waits for the next message.
    ///
    /// Returns `None` once the peer has closed its write end.
    pub async fn read(&mut self) -> Option<Message> {
        if let Some(pending) = self.pending.take() {
            return pending;
        }
        self.inbox.recv().await
    }

    /// Returns `true` if a message or end-of-stream is waiting to be read.
    pub fn is_ready(&mut self) -> bool {
        if self.pending.is_some() {
            return true;
        }
        match self.inbox.try_recv() {
            Ok(message) => {
                self.pending = Some(Some(message));
                true
            }
            Err(mpsc::error::TryRecvError::Disconnected) => {
                self.pending = Some(None);
                true
            }
            Err(mpsc::error::TryRecvError::Empty) => false,
        }
    }

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if self.pending.is_some() {
            return Poll::Ready(());
        }
        match self.inbox.poll_recv(cx) {
            Poll::Ready(message) => {
                self.pending = Some(message);
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }

    /// Releases both directions. Safe to call more than once.
    ///
    /// The peer observes end-of-stream; messages already buffered on this end
    /// can still be read.
    pub async fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("Shutdown of channel {} failed: {}", self.label, e);
            }
        }
        self.pump.abort();
        self.inbox.close();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("label", &self.label)
            .field("open", &self.writer.is_some())
            .finish()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Blocks until at least one of `channels` is readable.
///
/// A channel is readable when it holds an unread message or its peer has
/// closed. Returns the indices of every readable channel, in slice order.
/// Readiness that happened before the call is reported immediately.
///
/// Never resolves for an empty slice.
pub async fn wait_any(channels: &mut [&mut Channel]) -> Vec<usize> {
    poll_fn(|cx| {
        let mut ready = Vec::new();
        for (index, channel) in channels.iter_mut().enumerate() {
            if channel.poll_ready(cx).is_ready() {
                ready.push(index);
            }
        }

        if ready.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(ready)
        }
    })
    .await
}

/// Decodes lines from `reader` into the inbox until end-of-stream.
async fn pump<R>(label: String, reader: R, inbox: mpsc::UnboundedSender<Message>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = LinesStream::new(BufReader::new(reader).lines());

    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                debug!("Read from channel {} failed: {}", label, e);
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Message>(&line) {
            Ok(message) => {
                if inbox.send(message).is_err() {
                    break;
                }
            }
            Err(e) => warn!("Skipping undecodable line on channel {}: {}", label, e),
        }
    }
}

fn is_disconnect(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof
            | ErrorKind::WriteZero
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FileResult;

    #[tokio::test]
    async fn test_both_directions_are_independent() {
        let (mut left, mut right) = Channel::open();

        left.write(&Message::Next).await.unwrap();
        right
            .write(&Message::File {
                filename: Some("a_spec.rb".to_string()),
            })
            .await
            .unwrap();

        assert_eq!(right.read().await, Some(Message::Next));
        assert_eq!(
            left.read().await,
            Some(Message::File {
                filename: Some("a_spec.rb".to_string())
            })
        );
    }

    #[tokio::test]
    async fn test_close_is_end_of_stream_for_peer() {
        let (mut left, mut right) = Channel::open();

        left.write(&Message::Close).await.unwrap();
        left.close().await;
        left.close().await;

        assert_eq!(right.read().await, Some(Message::Close));
        assert_eq!(right.read().await, None);
        assert_eq!(right.read().await, None);
    }

    #[tokio::test]
    async fn test_write_after_close_is_broken() {
        let (mut left, _right) = Channel::open();
        left.close().await;

        let err = left.write(&Message::Next).await.unwrap_err();
        assert!(matches!(err, ChannelError::Broken(_)));
    }

    #[tokio::test]
    async fn test_write_to_dropped_peer_is_broken() {
        let (mut left, right) = Channel::open();
        drop(right);

        // The pump task of the dropped end releases its half asynchronously.
        let mut result = Ok(());
        for _ in 0..50 {
            result = left.write(&Message::Next).await;
            if result.is_err() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(matches!(result, Err(ChannelError::Broken(_))));
    }

    #[tokio::test]
    async fn test_wait_any_reports_only_ready_channels() {
        let (mut a, mut a_peer) = Channel::open();
        let (mut b, _b_peer) = Channel::open();
        let (mut c, mut c_peer) = Channel::open();

        a_peer.write(&Message::Next).await.unwrap();
        c_peer.close().await;

        let ready = {
            let mut set = vec![&mut a, &mut b, &mut c];
            wait_any(&mut set).await
        };
        assert_eq!(ready, vec![0, 2]);

        // Readiness observed by wait_any is not consumed.
        assert_eq!(a.read().await, Some(Message::Next));
        assert_eq!(c.read().await, None);
    }

    #[tokio::test]
    async fn test_wait_any_sees_messages_sent_before_the_call() {
        let (mut left, mut right) = Channel::open();
        right
            .write(&Message::Result(FileResult::new("a_spec.rb", "", 0)))
            .await
            .unwrap();

        let ready = wait_any(&mut [&mut left]).await;
        assert_eq!(ready, vec![0]);
        assert!(left.is_ready());
        assert!(matches!(left.read().await, Some(Message::Result(_))));
    }

    #[tokio::test]
    async fn test_undecodable_lines_are_skipped() {
        let (reader, mut raw_writer) = tokio::io::duplex(1024);
        let (_unused_reader, writer) = tokio::io::duplex(1024);
        let mut channel = Channel::new("raw", reader, writer);

        raw_writer
            .write_all(b"Loading environment...\n\n{\"command\":\"next\"}\n")
            .await
            .unwrap();
        drop(raw_writer);

        assert_eq!(channel.read().await, Some(Message::Next));
        assert_eq!(channel.read().await, None);
    }

    #[tokio::test]
    async fn test_lines_split_across_reads() {
        let reader = tokio_test::io::Builder::new()
            .read(b"{\"command\":\"rea")
            .read(b"dy\",\"framework\":\"rspec\"}\n{\"command\"")
            .read(b":\"close\"}\n")
            .build();
        let mut channel = Channel::new("mock", reader, tokio::io::sink());

        assert_eq!(
            channel.read().await,
            Some(Message::Ready {
                framework: "rspec".to_string()
            })
        );
        assert_eq!(channel.read().await, Some(Message::Close));
        assert_eq!(channel.read().await, None);
    }
}
