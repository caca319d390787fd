use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};

use crate::error::ProtocolError;
use crate::protocol::message::{decode, encode, Message};

/// Upper bound for a single frame. Jobs carry arbitrary user data, but
/// anything beyond this is treated as a broken peer.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Default depth of an [`Outbox`] queue.
pub const OUTBOX_CAPACITY: usize = 256;

/// Read side of a connection: yields one decoded message per frame.
pub struct MessageReader<R> {
    frames: FramedRead<R, LinesCodec>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            frames: FramedRead::new(inner, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH)),
        }
    }

    /// Wait for the next complete frame and decode it.
    pub async fn read_message(&mut self) -> Result<Message, ProtocolError> {
        match self.frames.next().await {
            Some(Ok(line)) => decode(&line),
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                Err(ProtocolError::FrameTooLong(MAX_FRAME_LENGTH))
            }
            Some(Err(LinesCodecError::Io(e))) => Err(ProtocolError::Io(e)),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }
}

/// Write side of a connection. Each message is written and flushed as one unit.
pub struct MessageWriter<W> {
    frames: FramedWrite<W, LinesCodec>,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            frames: FramedWrite::new(inner, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH)),
        }
    }

    pub async fn write_message(&mut self, message: &Message) -> Result<(), ProtocolError> {
        let line = encode(message)?;
        self.frames.send(line).await.map_err(|e| match e {
            LinesCodecError::MaxLineLengthExceeded => ProtocolError::FrameTooLong(MAX_FRAME_LENGTH),
            LinesCodecError::Io(e) => ProtocolError::Io(e),
        })
    }

    /// Flush and shut down the write direction so the peer sees end of stream.
    pub async fn close(&mut self) -> Result<(), ProtocolError> {
        SinkExt::<String>::close(&mut self.frames).await.map_err(|e| match e {
            LinesCodecError::MaxLineLengthExceeded => ProtocolError::FrameTooLong(MAX_FRAME_LENGTH),
            LinesCodecError::Io(e) => ProtocolError::Io(e),
        })
    }
}

/// A framed, bidirectional connection to a peer.
pub struct Connection<S> {
    reader: MessageReader<ReadHalf<S>>,
    writer: MessageWriter<WriteHalf<S>>,
    peer: String,
}

impl<S: AsyncRead + AsyncWrite> Connection<S> {
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            reader: MessageReader::new(read),
            writer: MessageWriter::new(write),
            peer: peer.into(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub async fn read_message(&mut self) -> Result<Message, ProtocolError> {
        self.reader.read_message().await
    }

    pub async fn write_message(&mut self, message: &Message) -> Result<(), ProtocolError> {
        self.writer.write_message(message).await
    }

    pub fn into_split(self) -> (MessageReader<ReadHalf<S>>, MessageWriter<WriteHalf<S>>) {
        (self.reader, self.writer)
    }
}

impl Connection<TcpStream> {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, ProtocolError> {
        let stream = TcpStream::connect(addr).await?;
        Self::from_tcp(stream)
    }

    pub fn from_tcp(stream: TcpStream) -> Result<Self, ProtocolError> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?.to_string();
        Ok(Self::new(stream, peer))
    }
}

/// Cloneable handle for queueing messages to one peer.
///
/// Every task that talks to a peer goes through its outbox, so frames from
/// concurrent senders never interleave on the wire.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Message>,
}

impl Outbox {
    pub async fn send(&self, message: Message) -> Result<(), ProtocolError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Like [`Outbox::send`], giving up if the queue stays full for `timeout`.
    pub async fn send_timeout(&self, message: Message, timeout: Duration) -> Result<(), ProtocolError> {
        self.tx
            .send_timeout(message, timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => ProtocolError::Stalled(timeout),
                SendTimeoutError::Closed(_) => ProtocolError::ConnectionClosed,
            })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Start the single writer task for a connection.
///
/// The task drains the outbox until every [`Outbox`] clone is dropped or a
/// write fails, then shuts the write direction down.
pub fn spawn_writer<W>(mut writer: MessageWriter<W>, capacity: usize) -> (Outbox, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Message>(capacity.max(1));
    let handle = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = writer.write_message(&message).await {
                tracing::warn!(command = %message.command(), error = %e, "Failed to write message");
                break;
            }
        }
        rx.close();
        let _ = writer.close().await;
    });
    (Outbox { tx }, handle)
}
