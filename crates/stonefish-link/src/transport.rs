//! Framed duplex transports.
//!
//! A [`Transport`] is an ordered, message-framed channel. A connection splits
//! it once into a [`FrameSink`] driven by its writer task and a
//! [`FrameSource`] driven by its reader task.

use crate::error::{LinkError, LinkResult};

use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

/// Maximum single frame size (16 MB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Outbound half of a transport.
#[async_trait]
pub trait FrameSink: Send + 'static {
    async fn send_frame(&mut self, frame: Vec<u8>) -> LinkResult<()>;

    /// Close the channel. The peer's source then yields `None`.
    async fn close(&mut self) -> LinkResult<()>;
}

/// Inbound half of a transport.
#[async_trait]
pub trait FrameSource: Send + 'static {
    /// Next frame, or `None` once the peer has closed.
    async fn next_frame(&mut self) -> LinkResult<Option<Vec<u8>>>;
}

/// An ordered, message-framed duplex channel.
pub trait Transport: Send + 'static {
    fn split(self) -> (Box<dyn FrameSink>, Box<dyn FrameSource>);
}

/// In-process transports backed by tokio channels.
pub mod memory {
    use super::*;
    use tokio::sync::mpsc;

    /// One end of an in-memory pair.
    pub struct MemoryTransport {
        tx: mpsc::UnboundedSender<Vec<u8>>,
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
    }

    /// Two connected ends.
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            MemoryTransport { tx: a_tx, rx: a_rx },
            MemoryTransport { tx: b_tx, rx: b_rx },
        )
    }

    pub struct MemorySink {
        tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    }

    pub struct MemorySource {
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
    }

    #[async_trait]
    impl FrameSink for MemorySink {
        async fn send_frame(&mut self, frame: Vec<u8>) -> LinkResult<()> {
            let tx = self.tx.as_ref().ok_or(LinkError::ConnectionClosed)?;
            tx.send(frame).map_err(|_| LinkError::ConnectionClosed)
        }

        async fn close(&mut self) -> LinkResult<()> {
            self.tx.take();
            Ok(())
        }
    }

    #[async_trait]
    impl FrameSource for MemorySource {
        async fn next_frame(&mut self) -> LinkResult<Option<Vec<u8>>> {
            Ok(self.rx.recv().await)
        }
    }

    impl Transport for MemoryTransport {
        fn split(self) -> (Box<dyn FrameSink>, Box<dyn FrameSource>) {
            (
                Box::new(MemorySink { tx: Some(self.tx) }),
                Box::new(MemorySource { rx: self.rx }),
            )
        }
    }
}

/// Length-prefixed frames over TCP: a 4-byte big-endian length, then the body.
pub struct TcpTransport {
    stream: TcpStream,
    max_message_size: u32,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    pub async fn connect(addr: SocketAddr) -> LinkResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }

    /// Reject frames larger than `max` in either direction.
    pub fn with_max_message_size(mut self, max: u32) -> Self {
        self.max_message_size = max;
        self
    }

    pub fn peer_addr(&self) -> LinkResult<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }
}

impl Transport for TcpTransport {
    fn split(self) -> (Box<dyn FrameSink>, Box<dyn FrameSource>) {
        let (reader, writer) = self.stream.into_split();
        (
            Box::new(TcpSink {
                writer,
                max: self.max_message_size,
            }),
            Box::new(TcpSource {
                reader,
                max: self.max_message_size,
            }),
        )
    }
}

struct TcpSink {
    writer: OwnedWriteHalf,
    max: u32,
}

struct TcpSource {
    reader: OwnedReadHalf,
    max: u32,
}

/// Prefix `body` with its length.
pub fn encode_frame(body: &[u8], max: u32) -> LinkResult<Vec<u8>> {
    let len = u32::try_from(body.len()).unwrap_or(u32::MAX);
    if len > max {
        return Err(LinkError::MessageTooLarge { size: len, max });
    }
    let mut bytes = Vec::with_capacity(4 + body.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(body);
    Ok(bytes)
}

#[async_trait]
impl FrameSink for TcpSink {
    async fn send_frame(&mut self, frame: Vec<u8>) -> LinkResult<()> {
        let bytes = encode_frame(&frame, self.max)?;
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> LinkResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[async_trait]
impl FrameSource for TcpSource {
    async fn next_frame(&mut self) -> LinkResult<Option<Vec<u8>>> {
        let mut header = [0u8; 4];
        match self.reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("Peer closed the stream");
                return Ok(None);
            }
            Err(e) => return Err(LinkError::Io(e)),
        }

        let len = u32::from_be_bytes(header);
        if len > self.max {
            return Err(LinkError::MessageTooLarge {
                size: len,
                max: self.max,
            });
        }

        let mut body = vec![0u8; len as usize];
        self.reader.read_exact(&mut body).await?;
        Ok(Some(body))
    }
}
