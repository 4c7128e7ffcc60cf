//! Async stream I/O for the pipe transport.
//!
//! Generic over the transport type: anything `AsyncRead`/`AsyncWrite`
//! works, including subprocess stdio, `tokio::io::duplex` halves, and
//! sockets. A single reader or writer is reused for the back-to-back
//! sequence of streams one pipe connection carries.

use std::io;

use arrow_schema::SchemaRef;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use vgi_types::RpcError;

use crate::batch::AnnotatedBatch;
use crate::frame::{
    decode_batch_message, decode_schema_header, parse_header, write_batch_message,
    write_schema_message, HeaderKind, CONTINUATION, EOS_MARKER,
};

/// Reads a sequence of IPC streams from an async byte stream.
pub struct IpcStreamReader<R> {
    inner: BufReader<R>,
}

enum OwnedMessage {
    Message { header: Vec<u8>, body: Vec<u8> },
    Eos,
}

impl<R: AsyncRead + Unpin> IpcStreamReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
        }
    }

    /// Fill `buf` exactly, or report a clean EOF if the stream ended
    /// before the first byte.
    async fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> Result<bool, RpcError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.inner.read(&mut buf[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(true);
                }
                return Err(RpcError::Transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "ipc message truncated mid-prefix",
                )));
            }
            filled += n;
        }
        Ok(false)
    }

    async fn read_exact(&mut self, buf: &mut [u8], what: &str) -> Result<(), RpcError> {
        self.inner
            .read_exact(buf)
            .await
            .map_err(|e| {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    RpcError::Transport(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("ipc stream truncated reading {what}"),
                    ))
                } else {
                    RpcError::Transport(e)
                }
            })
            .map(|_| ())
    }

    /// Read one encapsulated message. `None` means the underlying byte
    /// stream hit a clean EOF at a message boundary.
    async fn read_message(&mut self) -> Result<Option<OwnedMessage>, RpcError> {
        let mut prefix = [0u8; 4];
        if self.read_exact_or_eof(&mut prefix).await? {
            return Ok(None);
        }
        if prefix != CONTINUATION {
            return Err(RpcError::protocol(
                "malformed ipc stream: missing continuation marker",
            ));
        }
        let mut len_bytes = [0u8; 4];
        self.read_exact(&mut len_bytes, "message length").await?;
        let header_len = u32::from_le_bytes(len_bytes) as usize;
        if header_len == 0 {
            return Ok(Some(OwnedMessage::Eos));
        }
        let mut header = vec![0u8; header_len];
        self.read_exact(&mut header, "message header").await?;
        let (_, body_len) = parse_header(&header)?;
        let mut body = vec![0u8; body_len];
        self.read_exact(&mut body, "message body").await?;
        Ok(Some(OwnedMessage::Message { header, body }))
    }

    /// Read the schema message that opens the next stream.
    ///
    /// Returns `None` when the byte stream ended cleanly instead — the
    /// pipe server's shutdown signal.
    pub async fn begin_stream(&mut self) -> Result<Option<SchemaRef>, RpcError> {
        match self.read_message().await? {
            None => Ok(None),
            Some(OwnedMessage::Eos) => Err(RpcError::protocol(
                "ipc stream ended before its schema",
            )),
            Some(OwnedMessage::Message { header, .. }) => match parse_header(&header)? {
                (HeaderKind::Schema, _) => Ok(Some(decode_schema_header(&header)?)),
                (HeaderKind::RecordBatch, _) => Err(RpcError::protocol(
                    "ipc stream started with a record batch instead of a schema",
                )),
            },
        }
    }

    /// Read the next batch of the current stream; `None` at end-of-stream.
    pub async fn next_batch(
        &mut self,
        schema: &SchemaRef,
    ) -> Result<Option<AnnotatedBatch>, RpcError> {
        match self.read_message().await? {
            None => Err(RpcError::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "ipc stream ended without its end-of-stream marker",
            ))),
            Some(OwnedMessage::Eos) => Ok(None),
            Some(OwnedMessage::Message { header, body }) => match parse_header(&header)? {
                (HeaderKind::RecordBatch, _) => {
                    Ok(Some(decode_batch_message(&header, body, schema)?))
                }
                (HeaderKind::Schema, _) => Err(RpcError::protocol(
                    "unexpected schema message inside an ipc stream",
                )),
            },
        }
    }

    /// Read and discard the rest of the current stream.
    pub async fn drain_stream(&mut self, schema: &SchemaRef) -> Result<(), RpcError> {
        while self.next_batch(schema).await?.is_some() {}
        Ok(())
    }
}

/// Writes a sequence of IPC streams to an async byte stream.
///
/// Every message is flushed as soon as it is written so the peer can make
/// progress while this side blocks on its next read.
pub struct IpcStreamWriter<W> {
    inner: W,
    scratch: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> IpcStreamWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            scratch: Vec::with_capacity(1024),
        }
    }

    async fn send_scratch(&mut self) -> Result<(), RpcError> {
        self.inner.write_all(&self.scratch).await?;
        self.inner.flush().await?;
        self.scratch.clear();
        Ok(())
    }

    /// Open a new stream on the wire.
    pub async fn begin_stream(&mut self, schema: &SchemaRef) -> Result<(), RpcError> {
        self.scratch.clear();
        write_schema_message(&mut self.scratch, schema)?;
        self.send_scratch().await
    }

    pub async fn write_batch(&mut self, batch: &AnnotatedBatch) -> Result<(), RpcError> {
        self.scratch.clear();
        write_batch_message(&mut self.scratch, batch)?;
        self.send_scratch().await
    }

    /// Terminate the current stream.
    pub async fn finish_stream(&mut self) -> Result<(), RpcError> {
        self.scratch.clear();
        self.scratch.extend_from_slice(&EOS_MARKER);
        self.send_scratch().await
    }

    /// Flush and shut down the write side, signalling EOF to the peer.
    pub async fn shutdown(&mut self) -> Result<(), RpcError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
