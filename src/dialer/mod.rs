//! Outbound dialer
//!
//! A single process-wide dialer serves every outbound leg: tunnel
//! connections toward the server and backend connections alike. A successful
//! dial hands the write half to the caller's handler, then pumps the read
//! half through `on_bytes` until the socket closes. Each connection's pump
//! is its own task, so tens of thousands of concurrent flows only cost
//! their sockets and task stacks.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tracing::trace;

/// Per-attempt connect timeout
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Read buffer size for the per-connection pump
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Dialer errors
#[derive(Debug, Error)]
pub enum DialError {
    #[error("connect timed out")]
    Timeout,

    #[error("connect failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-connection callbacks for an outbound socket
#[async_trait]
pub trait DialHandler: Send + Sync + 'static {
    /// The socket is established. Receives the write half; the read half
    /// stays with the dialer's pump.
    async fn on_open(&self, writer: OwnedWriteHalf);

    /// A chunk arrived from the far side. Return `false` to stop the pump.
    async fn on_bytes(&self, data: Bytes) -> bool;

    /// The socket closed, by EOF or by error
    async fn on_close(&self, error: Option<std::io::Error>);
}

/// Process-wide outbound dialer
#[derive(Clone)]
pub struct Dialer {
    connect_timeout: Duration,
}

impl Default for Dialer {
    fn default() -> Self {
        Self::new()
    }
}

impl Dialer {
    pub fn new() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    /// Dial `addr` and wire the connection to `handler`.
    ///
    /// `on_open` has completed before this returns, so the caller knows
    /// any connection prefix has been written once `dial` succeeds. The
    /// read pump runs on its own task until the socket closes.
    pub async fn dial(&self, addr: &str, handler: Arc<dyn DialHandler>) -> Result<(), DialError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| DialError::Timeout)??;

        stream.set_nodelay(true).ok();

        let (mut read_half, write_half) = stream.into_split();
        handler.on_open(write_half).await;

        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => {
                        handler.on_close(None).await;
                        break;
                    }
                    Ok(n) => {
                        trace!(bytes = n, "Outbound socket delivered data");
                        let data = Bytes::copy_from_slice(&buf[..n]);
                        if !handler.on_bytes(data).await {
                            handler.on_close(None).await;
                            break;
                        }
                    }
                    Err(e) => {
                        handler.on_close(Some(e)).await;
                        break;
                    }
                }
            }
        });

        Ok(())
    }
}
