//! Datagram transport used by a transfer.
//!
//! The engine only needs to send a datagram to a peer and to wait a bounded
//! time for the next one, so [`DatagramChannel`] is the seam between the
//! protocol and the socket. [`UdpSocket`] is the production implementation.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::UdpSocket;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("receive timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Unreliable, unordered datagram transport.
#[async_trait]
pub trait DatagramChannel: Send + Sync {
    async fn send_datagram(&self, bytes: &[u8], peer: SocketAddr) -> io::Result<()>;

    /// Waits at most `wait` for one datagram, copying it into `buf`.
    async fn recv_timeout(
        &self,
        buf: &mut [u8],
        wait: Duration,
    ) -> Result<(usize, SocketAddr), ChannelError>;
}

#[async_trait]
impl DatagramChannel for UdpSocket {
    async fn send_datagram(&self, bytes: &[u8], peer: SocketAddr) -> io::Result<()> {
        self.send_to(bytes, peer).await?;
        Ok(())
    }

    async fn recv_timeout(
        &self,
        buf: &mut [u8],
        wait: Duration,
    ) -> Result<(usize, SocketAddr), ChannelError> {
        match tokio::time::timeout(wait, self.recv_from(buf)).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(ChannelError::Timeout),
        }
    }
}
