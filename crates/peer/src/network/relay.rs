//! WebSocket echo relay.
//!
//! Clients upgrade at [`RELAY_PATH`]; every text or binary frame a client
//! sends is written back to the same client unchanged. Other paths are
//! refused during the handshake with `404 Not Found`.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use protocol::error::{ProtocolError, Result};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::accept_with_retry;

/// Path the relay accepts upgrades on.
pub const RELAY_PATH: &str = "/websocket";

/// Byte-echo WebSocket server.
#[derive(Debug)]
pub struct RelayServer {
    listener: TcpListener,
}

impl RelayServer {
    /// Binds the relay to `address`.
    pub async fn bind<A: ToSocketAddrs>(address: A) -> Result<Self> {
        let listener = TcpListener::bind(address).await.map_err(|e| {
            ProtocolError::ConnectionError(format!("failed to start relay: {}", e))
        })?;
        Ok(Self { listener })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts clients forever, one task per client.
    pub async fn serve(&self) -> Result<()> {
        tracing::info!("relay listening on {}{}", self.local_addr()?, RELAY_PATH);
        loop {
            let (stream, addr) = accept_with_retry("relay client", || self.listener.accept()).await;

            tokio::spawn(async move {
                if let Err(e) = echo_connection(stream, addr).await {
                    tracing::warn!("relay client {}: {}", addr, e);
                }
            });
        }
    }
}

fn check_path(request: &Request, response: Response) -> std::result::Result<Response, ErrorResponse> {
    if request.uri().path() == RELAY_PATH {
        return Ok(response);
    }
    let mut refusal = ErrorResponse::new(Some("not found".to_string()));
    *refusal.status_mut() = StatusCode::NOT_FOUND;
    Err(refusal)
}

/// Upgrades one connection and echoes its frames until it closes.
pub async fn echo_connection(stream: TcpStream, addr: SocketAddr) -> Result<()> {
    let mut ws = tokio_tungstenite::accept_hdr_async(stream, check_path)
        .await
        .map_err(|e| ProtocolError::ConnectionError(format!("upgrade failed: {}", e)))?;
    tracing::info!("relay client connected: {}", addr);

    while let Some(frame) = ws.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("relay read from {} failed: {}", addr, e);
                break;
            }
        };

        match frame {
            WsMessage::Text(_) | WsMessage::Binary(_) => {
                if let Err(e) = ws.send(frame).await {
                    tracing::debug!("relay write to {} failed: {}", addr, e);
                    break;
                }
            }
            WsMessage::Close(_) => break,
            // Pings are answered by tungstenite.
            _ => {}
        }
    }

    tracing::info!("relay client disconnected: {}", addr);
    Ok(())
}
