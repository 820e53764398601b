//! In this crate, the concept of a "transport" abstracts away the details of how lines of JSON-RPC
//! text are moved between this process and the remote peer.  For ACP that is almost always the
//! stdin and stdout of an agent running as a child process (see the `acpox-client` crate), but
//! at this level a transport is simply a source of inbound lines, a sink for outbound lines, and
//! an optional hook to tear down whatever is underneath when the connection closes.
//!
//! Once bound to a connection, a transport is serviced by two independent tasks wrapped up in
//! [`Peer`]: a reader that forwards lines to the connection's event loop in arrival order, and a
//! writer that drains a FIFO queue of outbound lines one at a time.  Neither blocks the other.
use std::borrow::Cow;
use std::pin::Pin;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::Instrument;

use crate::codec::{DecodeError, NdjsonCodec};
use crate::{JsonRpcError, Result};

/// Capacity of the channel on which the reader passes inbound lines to the event loop.  Once this
/// many lines are waiting the reader stops reading, which pushes back on the remote peer.
const INBOUND_EVENT_CHANNEL_BOUNDS: usize = 64;

/// Stream of inbound lines of JSON-RPC text, one message per line.
pub type LineStream = Pin<Box<dyn Stream<Item = Result<String>> + Send + 'static>>;

/// Sink for outbound lines of JSON-RPC text.  The sink is responsible for the line terminator.
pub type LineSink = Pin<Box<dyn Sink<String, Error = JsonRpcError> + Send + 'static>>;

/// A transport is a source and sink of lines of JSON-RPC text, that interfaces with some
/// underlying transport layer provided by the caller.
pub trait Transport: Send + Sized + 'static {
    /// Transport-specific identifier of the remote peer, useful for logging and debugging.
    fn remote_peer(&self) -> Cow<'static, str>;

    /// A tracing span that the connection's event loop and tasks run within, so that transport
    /// specifics (like a process ID) show up in log events.
    fn span(&self) -> tracing::Span {
        tracing::Span::none()
    }

    /// Break the transport into its inbound and outbound halves, plus whatever needs to run when
    /// the connection is finished with it.
    fn into_parts(self) -> TransportParts;
}

/// The pieces a [`Transport`] is made of, see [`Transport::into_parts`].
pub struct TransportParts {
    pub inbound: LineStream,
    pub outbound: LineSink,
    pub close: CloseHandle,
}

/// Transport-specific teardown, run once after the connection has stopped writing to the
/// transport.
///
/// Once the teardown finishes, the connection keeps reading for up to the drain timeout, until the
/// inbound stream ends.  The default is not to wait at all beyond what has already arrived.
pub struct CloseHandle {
    close: Option<BoxFuture<'static, ()>>,
    drain_timeout: Duration,
}

impl CloseHandle {
    /// Nothing to do on close; dropping the halves is enough
    pub fn none() -> Self {
        Self {
            close: None,
            drain_timeout: Duration::ZERO,
        }
    }

    pub fn new(close: impl Future<Output = ()> + Send + 'static) -> Self {
        Self {
            close: Some(close.boxed()),
            drain_timeout: Duration::ZERO,
        }
    }

    /// How long to keep reading after the teardown, for output the remote peer writes on its way
    /// out
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    pub(crate) async fn close(self) {
        if let Some(close) = self.close {
            close.await;
        }
    }
}

impl std::fmt::Debug for CloseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloseHandle")
            .field("close", &self.close.is_some())
            .field("drain_timeout", &self.drain_timeout)
            .finish()
    }
}

/// Implement transport on stream/sink pairs, mainly for testing with in-memory channels.
impl<In, InErr, Out> Transport for (In, Out)
where
    In: Stream<Item = Result<String, InErr>> + Send + 'static,
    InErr: std::error::Error + Send + Sync + 'static,
    Out: Sink<String> + Send + 'static,
    Out::Error: std::error::Error + Send + Sync + 'static,
{
    fn remote_peer(&self) -> Cow<'static, str> {
        format!(
            "({}, {})",
            std::any::type_name::<In>(),
            std::any::type_name::<Out>(),
        )
        .into()
    }

    fn into_parts(self) -> TransportParts {
        let (inbound, outbound) = self;
        TransportParts {
            inbound: inbound.map(|result| result.map_err(JsonRpcError::transport)).boxed(),
            outbound: Box::pin(outbound.sink_map_err(JsonRpcError::transport)),
            close: CloseHandle::none(),
        }
    }
}

/// Implementation of [`Transport`] that is generic over any type that implements
/// [`tokio::io::AsyncRead`] and [`tokio::io::AsyncWrite`], framed as newline-delimited JSON.
///
/// Useful for tests with [`tokio::io::duplex`], and for an agent that talks ACP over its own stdio.
impl<Io> Transport for Framed<Io, NdjsonCodec>
where
    Io: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn remote_peer(&self) -> Cow<'static, str> {
        Cow::Borrowed(std::any::type_name::<Io>())
    }

    fn into_parts(self) -> TransportParts {
        let (sink, stream) = StreamExt::split::<String>(self);
        TransportParts {
            inbound: stream.map(ndjson_item_to_line).boxed(),
            outbound: Box::pin(sink.sink_map_err(JsonRpcError::transport)),
            close: CloseHandle::none(),
        }
    }
}

/// Flatten an item produced by a stream framed with [`NdjsonCodec`] into a line or an error.
///
/// An oversized line is an item-level error that the reader reports and then keeps going; an
/// I/O error is a transport error.
pub fn ndjson_item_to_line(item: Result<Result<String, DecodeError>, std::io::Error>) -> Result<String> {
    match item {
        Ok(Ok(line)) => Ok(line),
        Ok(Err(DecodeError::Oversized { max_length })) => Err(JsonRpcError::OversizedMessage { max_length }),
        Ok(Err(e)) => Err(e.into()),
        Err(e) => Err(JsonRpcError::transport(e)),
    }
}

/// Something that happened on the transport, reported to the connection's event loop
#[derive(Debug)]
pub(crate) enum TransportEvent {
    /// A complete line arrived from the remote peer
    Line(String),

    /// A line could not be read, but the stream is still usable (for example it was too long)
    ReadError(JsonRpcError),

    /// The inbound stream ended or failed in a way that it cannot recover from
    Closed { reason: Option<JsonRpcError> },

    /// A write to the transport failed.  The writer has stopped.
    WriteFailed { message: String },
}

/// A line waiting in the writer's queue, with an optional channel on which the issuer wants to hear
/// the outcome of the write.
pub(crate) struct OutboundFrame {
    pub line: String,
    pub confirm: Option<oneshot::Sender<Result<()>>>,
}

/// The engine's side of a bound transport: the running reader and writer tasks, and the transport's
/// close hook.
///
/// Owned by the connection event loop.
pub(crate) struct Peer {
    remote_peer: Cow<'static, str>,
    span: tracing::Span,
    events: mpsc::Receiver<TransportEvent>,
    outbound: Option<mpsc::UnboundedSender<OutboundFrame>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    close: CloseHandle,
}

impl Peer {
    /// Split the transport and start the reader and writer tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn new(transport: impl Transport) -> Self {
        let remote_peer = transport.remote_peer();
        let span = transport.span();
        let TransportParts {
            inbound,
            outbound,
            close,
        } = transport.into_parts();

        let (events_tx, events_rx) = mpsc::channel(INBOUND_EVENT_CHANNEL_BOUNDS);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(
            Self::reader_loop(inbound, events_tx.clone()).instrument(tracing::debug_span!(parent: &span, "reader")),
        );
        let writer = tokio::spawn(
            Self::writer_loop(outbound, outbound_rx, events_tx).instrument(tracing::debug_span!(parent: &span, "writer")),
        );

        Self {
            remote_peer,
            span,
            events: events_rx,
            outbound: Some(outbound_tx),
            reader,
            writer,
            close,
        }
    }

    pub(crate) fn remote_peer(&self) -> Cow<'static, str> {
        self.remote_peer.clone()
    }

    pub(crate) fn span(&self) -> tracing::Span {
        self.span.clone()
    }

    /// Wait for the next thing to happen on the transport.
    ///
    /// Cancel safe.  Once the transport is closed, this keeps returning [`TransportEvent::Closed`].
    pub(crate) async fn next_event(&mut self) -> TransportEvent {
        self.events
            .recv()
            .await
            .unwrap_or(TransportEvent::Closed { reason: None })
    }

    /// Queue a line for the writer.
    ///
    /// If the writer has already stopped, the confirmation (if any) is failed immediately.
    pub(crate) fn send(&self, line: String, confirm: Option<oneshot::Sender<Result<()>>>) {
        let frame = OutboundFrame { line, confirm };
        let rejected = match &self.outbound {
            Some(outbound) => outbound.send(frame).err().map(|e| e.0),
            None => Some(frame),
        };

        if let Some(OutboundFrame {
            confirm: Some(confirm), ..
        }) = rejected
        {
            let _ = confirm.send(Err(JsonRpcError::ConnectionClosed));
        }
    }

    /// Let the writer flush whatever is still queued, tear the transport down, then read what the
    /// remote peer wrote on its way out until its output ends or the drain timeout passes.
    ///
    /// Returns the lines that arrived after the event loop stopped reading.
    pub(crate) async fn close(self) -> Vec<String> {
        let Self {
            remote_peer,
            mut events,
            outbound,
            reader,
            writer,
            close,
            ..
        } = self;
        let drain_timeout = close.drain_timeout();
        let mut leftover = Vec::new();

        // Closing the queue is the writer's signal to flush and exit
        drop(outbound);
        let teardown = async move {
            if let Err(e) = writer.await {
                tracing::error!(err = %e, "Transport writer task failed");
            }
            close.close().await;
        };
        tokio::pin!(teardown);

        // Keep reading during teardown so the remote peer never stalls on a full pipe
        let mut open = true;
        loop {
            tokio::select! {
                () = &mut teardown => break,
                event = events.recv(), if open => open = Self::keep_leftover(event, &mut leftover),
            }
        }

        if open {
            let drain = async {
                while Self::keep_leftover(events.recv().await, &mut leftover) {}
            };
            if tokio::time::timeout(drain_timeout, drain).await.is_err() {
                tracing::debug!(?drain_timeout, "Inbound stream still open after teardown; abandoning it");
            }
        }

        reader.abort();
        let _ = reader.await;
        tracing::debug!(remote_peer = %remote_peer, leftover = leftover.len(), "Transport closed");
        leftover
    }

    /// Hold on to a line that arrived while closing.  Returns `false` once the inbound stream has
    /// ended.
    fn keep_leftover(event: Option<TransportEvent>, leftover: &mut Vec<String>) -> bool {
        match event {
            Some(TransportEvent::Line(line)) => {
                leftover.push(line);
                true
            }
            Some(TransportEvent::ReadError(e)) => {
                tracing::debug!(err = %e, "Unreadable line while closing");
                true
            }
            Some(TransportEvent::WriteFailed { .. }) => true,
            Some(TransportEvent::Closed { .. }) | None => false,
        }
    }

    async fn reader_loop(mut inbound: LineStream, events: mpsc::Sender<TransportEvent>) {
        tracing::trace!("Reader is starting");

        loop {
            let event = match inbound.next().await {
                Some(Ok(line)) => TransportEvent::Line(line),
                Some(Err(e @ JsonRpcError::Transport { .. })) => {
                    tracing::warn!(err = %e, "Error reading from transport; treating it as closed");
                    let _ = events.send(TransportEvent::Closed { reason: Some(e) }).await;
                    break;
                }
                Some(Err(e)) => {
                    // Recoverable; the next line is still readable
                    TransportEvent::ReadError(e)
                }
                None => {
                    tracing::debug!("Remote peer closed the inbound stream");
                    let _ = events.send(TransportEvent::Closed { reason: None }).await;
                    break;
                }
            };

            if events.send(event).await.is_err() {
                // Nobody is listening anymore
                break;
            }
        }
    }

    async fn writer_loop(
        mut outbound: LineSink,
        mut queue: mpsc::UnboundedReceiver<OutboundFrame>,
        events: mpsc::Sender<TransportEvent>,
    ) {
        tracing::trace!("Writer is starting");

        while let Some(OutboundFrame { line, confirm }) = queue.recv().await {
            match outbound.send(line).await {
                Ok(()) => {
                    if let Some(confirm) = confirm {
                        let _ = confirm.send(Ok(()));
                    }
                }
                Err(e) => {
                    tracing::warn!(err = %e, "Failed to write to transport; writer is stopping");
                    let message = e.to_string();
                    if let Some(confirm) = confirm {
                        let _ = confirm.send(Err(e));
                    }

                    // Everything still queued will never be written
                    queue.close();
                    while let Some(frame) = queue.recv().await {
                        if let Some(confirm) = frame.confirm {
                            let _ = confirm.send(Err(JsonRpcError::ConnectionClosed));
                        }
                    }

                    let _ = events.send(TransportEvent::WriteFailed { message }).await;
                    return;
                }
            }
        }

        if let Err(e) = outbound.close().await {
            tracing::debug!(err = %e, "Error closing transport sink");
        }
        tracing::trace!("Writer is exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use futures::channel::mpsc as fmpsc;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, duplex};

    #[tokio::test]
    async fn test_stream_sink_transport() {
        let (tx, rx) = fmpsc::unbounded::<String>();
        let (out_tx, mut out_rx) = fmpsc::unbounded::<String>();

        let transport = (rx.map(Ok::<String, std::io::Error>), out_tx);
        assert!(transport.remote_peer().contains("UnboundedReceiver"));
        assert!(transport.remote_peer().contains("UnboundedSender"));

        let TransportParts {
            mut inbound,
            mut outbound,
            ..
        } = transport.into_parts();

        tx.unbounded_send("inbound message".to_string()).unwrap();
        assert_eq!(inbound.next().await.unwrap().unwrap(), "inbound message");

        outbound.send("outbound message".to_string()).await.unwrap();
        assert_eq!(out_rx.next().await.unwrap(), "outbound message");

        drop(tx);
        assert!(inbound.next().await.is_none());
    }

    #[tokio::test]
    async fn test_framed_transport_adds_and_strips_newlines() {
        let (ours, theirs) = duplex(1024);
        let transport = Framed::new(ours, NdjsonCodec::new());
        assert!(!transport.remote_peer().is_empty());

        let TransportParts {
            mut inbound,
            mut outbound,
            ..
        } = Transport::into_parts(transport);

        let (their_read, mut their_write) = tokio::io::split(theirs);
        let mut their_lines = BufReader::new(their_read).lines();

        outbound.send("{\"a\":1}".to_string()).await.unwrap();
        assert_eq!(their_lines.next_line().await.unwrap().unwrap(), "{\"a\":1}");

        their_write.write_all(b"{\"b\":2}\n\n{\"c\":3}\n").await.unwrap();
        assert_eq!(inbound.next().await.unwrap().unwrap(), "{\"b\":2}");
        assert_eq!(inbound.next().await.unwrap().unwrap(), "{\"c\":3}");
    }

    #[tokio::test]
    async fn test_framed_oversized_line_is_not_fatal() {
        let (ours, mut theirs) = duplex(1024);
        let transport = Framed::new(ours, NdjsonCodec::new_with_max_length(32));
        let TransportParts { mut inbound, .. } = Transport::into_parts(transport);

        theirs
            .write_all(format!("{}\n{{\"ok\":true}}\n", "x".repeat(100)).as_bytes())
            .await
            .unwrap();

        assert_matches!(
            inbound.next().await,
            Some(Err(JsonRpcError::OversizedMessage { max_length: 32 }))
        );
        assert_eq!(inbound.next().await.unwrap().unwrap(), "{\"ok\":true}");
    }

    #[tokio::test]
    async fn test_peer_preserves_order_both_ways() {
        let (in_tx, in_rx) = fmpsc::unbounded::<String>();
        let (out_tx, out_rx) = fmpsc::unbounded::<String>();
        let mut peer = Peer::new((in_rx.map(Ok::<String, std::io::Error>), out_tx));

        for i in 0..10 {
            in_tx.unbounded_send(format!("line {i}")).unwrap();
            peer.send(format!("out {i}"), None);
        }
        drop(in_tx);

        for i in 0..10 {
            assert_matches!(peer.next_event().await, TransportEvent::Line(line) if line == format!("line {i}"));
        }
        assert_matches!(peer.next_event().await, TransportEvent::Closed { reason: None });

        let (confirm_tx, confirm_rx) = oneshot::channel();
        peer.send("last".to_string(), Some(confirm_tx));
        confirm_rx.await.unwrap().unwrap();

        peer.close().await;
        let written: Vec<String> = out_rx.collect().await;
        let mut expected: Vec<String> = (0..10).map(|i| format!("out {i}")).collect();
        expected.push("last".to_string());
        assert_eq!(written, expected);
    }

    #[tokio::test]
    async fn test_peer_write_failure_fails_fast() {
        let (_in_tx, in_rx) = fmpsc::unbounded::<String>();
        let (out_tx, out_rx) = fmpsc::unbounded::<String>();
        drop(out_rx);
        let mut peer = Peer::new((in_rx.map(Ok::<String, std::io::Error>), out_tx));

        let (confirm_tx, confirm_rx) = oneshot::channel();
        peer.send("doomed".to_string(), Some(confirm_tx));
        assert_matches!(confirm_rx.await.unwrap(), Err(JsonRpcError::Transport { .. }));
        assert_matches!(peer.next_event().await, TransportEvent::WriteFailed { .. });

        // Once the writer is gone, further writes are refused without waiting
        let (confirm_tx, confirm_rx) = oneshot::channel();
        peer.send("also doomed".to_string(), Some(confirm_tx));
        assert_matches!(confirm_rx.await.unwrap(), Err(JsonRpcError::ConnectionClosed));

        peer.close().await;
    }

    /// A transport assembled from parts, to control what happens on close
    struct Assembled(TransportParts);

    impl Transport for Assembled {
        fn remote_peer(&self) -> Cow<'static, str> {
            Cow::Borrowed("assembled")
        }

        fn into_parts(self) -> TransportParts {
            self.0
        }
    }

    fn assembled(
        inbound: fmpsc::UnboundedReceiver<String>,
        close: CloseHandle,
    ) -> (Assembled, fmpsc::UnboundedReceiver<String>) {
        let (out_tx, out_rx) = fmpsc::unbounded::<String>();
        let transport = Assembled(TransportParts {
            inbound: inbound.map(Ok::<String, JsonRpcError>).boxed(),
            outbound: Box::pin(out_tx.sink_map_err(JsonRpcError::transport)),
            close,
        });
        (transport, out_rx)
    }

    #[tokio::test]
    async fn test_peer_close_reads_output_written_during_teardown() {
        let (in_tx, in_rx) = fmpsc::unbounded::<String>();

        // Like an agent that says goodbye on SIGTERM, then exits
        let close = CloseHandle::new(async move {
            in_tx.unbounded_send("goodbye".to_string()).unwrap();
        })
        .with_drain_timeout(Duration::from_secs(30));
        let (transport, _out_rx) = assembled(in_rx, close);
        let peer = Peer::new(transport);

        let leftover = tokio::time::timeout(Duration::from_secs(5), peer.close())
            .await
            .expect("close waited out the drain timeout even though the output ended");
        assert_eq!(leftover, vec!["goodbye".to_string()]);
    }

    #[tokio::test]
    async fn test_peer_close_abandons_output_that_never_ends() {
        let (in_tx, in_rx) = fmpsc::unbounded::<String>();
        let close = CloseHandle::new(async {}).with_drain_timeout(Duration::from_millis(100));
        let (transport, _out_rx) = assembled(in_rx, close);
        let peer = Peer::new(transport);

        in_tx.unbounded_send("late".to_string()).unwrap();
        let started = tokio::time::Instant::now();
        let leftover = peer.close().await;

        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(leftover, vec!["late".to_string()]);
        drop(in_tx);
    }
}
