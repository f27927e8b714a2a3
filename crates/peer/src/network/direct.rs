//! Direct TCP sessions.
//!
//! A direct session is one raw bidirectional connection with two loops:
//! - the receive loop forwards every read chunk, unsegmented, to a sink
//! - the send loop writes each operator line followed by `\n`
//!
//! The receive loop owns the session's termination signal. When it sees EOF
//! or an error it fires the signal and exits; the send loop stops at its next
//! input wait. A send failure ends only the send loop, and the session ends
//! when the receive loop does.
//!
//! Inbound chunks are not line-aligned: one read may hold part of a line or
//! several lines.

use std::net::SocketAddr;
use std::sync::Arc;

use protocol::error::{ProtocolError, Result};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, Lines};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_util::sync::CancellationToken;

use super::accept_with_retry;
use crate::sink::MessageSink;

/// Default size of a single read from the connection.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;

/// Why the receive loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveEnd {
    /// The peer closed its write side.
    PeerClosed,
    /// A read failed.
    Failed(String),
}

/// Why the send loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendEnd {
    /// Operator input reached end of file.
    InputClosed,
    /// A write to the connection failed.
    WriteFailed(String),
    /// The receive loop ended the session.
    Terminated,
}

/// Summary of a finished direct session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    /// Remote address or other peer description.
    pub peer: String,
    /// Bytes delivered to the sink.
    pub bytes_received: u64,
    /// Bytes written to the connection, newlines included.
    pub bytes_sent: u64,
    /// How the receive loop ended.
    pub receive_end: ReceiveEnd,
    /// How the send loop ended.
    pub send_end: SendEnd,
}

/// Accepts direct connections.
#[derive(Debug)]
pub struct DirectListener {
    listener: TcpListener,
}

impl DirectListener {
    /// Binds a listener to `address`.
    pub async fn bind<A: ToSocketAddrs>(address: A) -> Result<Self> {
        let listener = TcpListener::bind(address).await.map_err(|e| {
            ProtocolError::ConnectionError(format!("failed to start listener: {}", e))
        })?;
        Ok(Self { listener })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Waits for the next connection.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await.map_err(|e| {
            ProtocolError::ConnectionError(format!("failed to accept connection: {}", e))
        })?;
        tracing::info!("new connection established with {}", addr);
        Ok((stream, addr))
    }

    /// Serves accepted connections one at a time until operator input ends.
    ///
    /// A failed accept is logged and retried after a short pause.
    pub async fn serve<R>(
        &self,
        input: &mut Lines<R>,
        sink: Arc<dyn MessageSink>,
        read_buffer_size: usize,
    ) -> Vec<SessionReport>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut reports = Vec::new();
        loop {
            let (stream, addr) = accept_with_retry("connection", || self.listener.accept()).await;
            tracing::info!("new connection established with {}", addr);

            let report =
                run_session(stream, &addr.to_string(), input, sink.clone(), read_buffer_size).await;
            let input_closed = report.send_end == SendEnd::InputClosed;
            reports.push(report);

            if input_closed {
                return reports;
            }
        }
    }
}

/// Connects to a peer.
pub async fn connect<A: ToSocketAddrs>(address: A) -> Result<TcpStream> {
    let stream = TcpStream::connect(address).await.map_err(|e| {
        ProtocolError::ConnectionError(format!("failed to connect to peer: {}", e))
    })?;
    if let Ok(addr) = stream.peer_addr() {
        tracing::info!("connected to {}", addr);
    }
    Ok(stream)
}

/// Runs one direct session to completion.
///
/// Never fails: connection errors end the session and are recorded in the
/// returned report.
pub async fn run_session<S, R>(
    stream: S,
    peer: &str,
    input: &mut Lines<R>,
    sink: Arc<dyn MessageSink>,
    read_buffer_size: usize,
) -> SessionReport
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    R: AsyncBufRead + Unpin,
{
    let (reader, writer) = tokio::io::split(stream);
    let terminated = CancellationToken::new();

    let receiver = tokio::spawn(receive_loop(
        reader,
        peer.to_string(),
        sink,
        read_buffer_size.max(1),
        terminated.clone(),
    ));

    let (send_end, bytes_sent) = send_loop(writer, input, &terminated).await;

    let (receive_end, bytes_received) = match receiver.await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!("receive loop for {} aborted: {}", peer, e);
            (ReceiveEnd::Failed(e.to_string()), 0)
        }
    };

    tracing::info!(
        "session with {} ended ({} bytes in, {} bytes out)",
        peer,
        bytes_received,
        bytes_sent
    );

    SessionReport {
        peer: peer.to_string(),
        bytes_received,
        bytes_sent,
        receive_end,
        send_end,
    }
}

async fn receive_loop<R>(
    mut reader: R,
    peer: String,
    sink: Arc<dyn MessageSink>,
    read_buffer_size: usize,
    terminated: CancellationToken,
) -> (ReceiveEnd, u64)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; read_buffer_size];
    let mut total = 0u64;

    let end = loop {
        match reader.read(&mut buffer).await {
            Ok(0) => {
                tracing::info!("connection closed by {}", peer);
                break ReceiveEnd::PeerClosed;
            }
            Ok(n) => {
                total += n as u64;
                sink.deliver(&peer, &buffer[..n]);
            }
            Err(e) => {
                tracing::warn!("error reading from {}: {}", peer, e);
                break ReceiveEnd::Failed(e.to_string());
            }
        }
    };

    terminated.cancel();
    (end, total)
}

async fn send_loop<W, R>(
    mut writer: W,
    input: &mut Lines<R>,
    terminated: &CancellationToken,
) -> (SendEnd, u64)
where
    W: AsyncWrite + Unpin,
    R: AsyncBufRead + Unpin,
{
    let mut total = 0u64;

    let end = loop {
        let line = tokio::select! {
            _ = terminated.cancelled() => break SendEnd::Terminated,
            line = input.next_line() => line,
        };

        match line {
            Ok(Some(line)) => {
                let mut message = line.into_bytes();
                message.push(b'\n');
                if let Err(e) = write_message(&mut writer, &message).await {
                    tracing::warn!("failed to send message: {}", e);
                    break SendEnd::WriteFailed(e.to_string());
                }
                total += message.len() as u64;
            }
            Ok(None) => {
                tracing::debug!("operator input closed, shutting down write side");
                if let Err(e) = writer.shutdown().await {
                    tracing::debug!("shutdown failed: {}", e);
                }
                break SendEnd::InputClosed;
            }
            Err(e) => {
                tracing::warn!("failed to read operator input: {}", e);
                if let Err(e) = writer.shutdown().await {
                    tracing::debug!("shutdown failed: {}", e);
                }
                break SendEnd::InputClosed;
            }
        }
    };

    (end, total)
}

async fn write_message<W>(writer: &mut W, message: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(message).await?;
    writer.flush().await
}
