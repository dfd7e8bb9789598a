//! Byte-stream transport seam between the endpoint and the outside world.
//!
//! A transport is a sink half (whole outbound frames, already newline
//! terminated) and a source half (inbound byte chunks of arbitrary
//! granularity; the frame buffer reassembles). The child-stdio variant wires
//! a spawned peer's pipes; the generic io variant adapts any
//! `AsyncRead`/`AsyncWrite` pair (network streams, `tokio::io::duplex` in
//! tests); the string-frame variant adapts message-oriented channels such as
//! a WebSocket text stream.

use std::io;

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    process::{ChildStdin, ChildStdout},
    sync::mpsc,
};

/// Outbound half: accepts whole framed messages.
#[async_trait]
pub trait ByteSink: Send + Sync {
    async fn send(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Flushes and closes the sink. Default is a no-op.
    async fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Inbound half: yields byte chunks until the stream ends.
#[async_trait]
pub trait ByteSource: Send + Sync {
    /// Next chunk of inbound bytes; `None` marks a graceful end of stream.
    async fn recv(&mut self) -> io::Result<Option<Vec<u8>>>;
}

/// A connected pair of transport halves.
pub struct Transport {
    pub sink: Box<dyn ByteSink>,
    pub source: Box<dyn ByteSource>,
}

impl Transport {
    /// Adapts an `AsyncRead`/`AsyncWrite` pair.
    pub fn from_io<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + Sync + 'static,
        W: AsyncWrite + Unpin + Send + Sync + 'static,
    {
        Transport {
            sink: Box::new(IoSink(writer)),
            source: Box::new(IoSource(reader)),
        }
    }

    /// Wires a spawned child's stdio pipes.
    pub fn from_child_stdio(stdin: ChildStdin, stdout: ChildStdout) -> Self {
        Self::from_io(stdout, stdin)
    }

    /// Adapts a message-oriented duplex channel carrying UTF-8 text frames.
    /// Inbound strings are forwarded as bytes; outbound frames must be valid
    /// UTF-8 (JSON frames always are).
    pub fn from_string_frames(
        outbound: mpsc::Sender<String>,
        inbound: mpsc::Receiver<String>,
    ) -> Self {
        Transport {
            sink: Box::new(StringFrameSink(outbound)),
            source: Box::new(StringFrameSource(inbound)),
        }
    }
}

struct IoSink<W>(W);

#[async_trait]
impl<W: AsyncWrite + Unpin + Send + Sync> ByteSink for IoSink<W> {
    async fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.0.write_all(bytes).await?;
        self.0.flush().await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.0.shutdown().await
    }
}

struct IoSource<R>(R);

#[async_trait]
impl<R: AsyncRead + Unpin + Send + Sync> ByteSource for IoSource<R> {
    async fn recv(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut chunk = vec![0u8; 8192];
        let n = self.0.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        chunk.truncate(n);
        Ok(Some(chunk))
    }
}

struct StringFrameSink(mpsc::Sender<String>);

#[async_trait]
impl ByteSink for StringFrameSink {
    async fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        let text = String::from_utf8(bytes.to_vec())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.0
            .send(text)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "frame channel closed"))
    }
}

struct StringFrameSource(mpsc::Receiver<String>);

#[async_trait]
impl ByteSource for StringFrameSource {
    async fn recv(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.0.recv().await.map(String::into_bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn io_transport_round_trips() {
        let (client, server) = tokio::io::duplex(256);
        let (read_half, write_half) = tokio::io::split(client);
        let mut transport = Transport::from_io(read_half, write_half);

        let (mut server_read, mut server_write) = tokio::io::split(server);
        transport.sink.send(b"{\"a\":1}\n").await.unwrap();
        let mut buf = vec![0u8; 32];
        let n = server_read.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"{\"a\":1}\n");

        server_write.write_all(b"{\"b\":2}\n").await.unwrap();
        let chunk = transport.source.recv().await.unwrap().unwrap();
        assert_eq!(chunk, b"{\"b\":2}\n");
    }

    #[tokio::test]
    async fn string_frame_transport_forwards_text() {
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let (in_tx, in_rx) = mpsc::channel(4);
        let mut transport = Transport::from_string_frames(out_tx, in_rx);

        transport.sink.send(b"{\"x\":true}\n").await.unwrap();
        assert_eq!(out_rx.recv().await.unwrap(), "{\"x\":true}\n");

        in_tx.send("{\"y\":false}\n".to_string()).await.unwrap();
        let chunk = transport.source.recv().await.unwrap().unwrap();
        assert_eq!(chunk, b"{\"y\":false}\n");

        drop(in_tx);
        assert!(transport.source.recv().await.unwrap().is_none());
    }
}
