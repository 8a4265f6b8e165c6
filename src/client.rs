use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::UdpSocket;
use tracing::debug;

use crate::packet::TftpPacket;
use crate::storage::{ByteSink, ByteSource};
use crate::transfer::{Peer, Transfer, TransferConfig, TransferError, TransferStats};
use crate::MODE_OCTET;

/// Client side of the protocol. Each call runs one transfer from its own
/// ephemeral port.
#[derive(Debug, Clone, Copy)]
pub struct Client {
    server: SocketAddr,
    config: TransferConfig,
}

impl Client {
    pub fn new(server: SocketAddr, config: TransferConfig) -> Self {
        Self { server, config }
    }

    /// Downloads `remote` into `sink`.
    pub async fn get<W>(&self, remote: &str, sink: &mut W) -> Result<TransferStats, TransferError>
    where
        W: ByteSink + Send + ?Sized,
    {
        let rrq = TftpPacket::RRQ {
            filename: check_name(remote)?,
            mode: MODE_OCTET.to_string(),
        };
        let socket = self.bind().await?;
        Transfer::new(&socket, Peer::unlocked(self.server), self.config)
            .receive(sink, rrq)
            .await
    }

    /// Uploads `source` as `remote`.
    pub async fn put<R>(&self, remote: &str, source: &mut R) -> Result<TransferStats, TransferError>
    where
        R: ByteSource + Send + ?Sized,
    {
        let wrq = TftpPacket::WRQ {
            filename: check_name(remote)?,
            mode: MODE_OCTET.to_string(),
        };
        let socket = self.bind().await?;
        Transfer::new(&socket, Peer::unlocked(self.server), self.config)
            .send(source, Some(wrq))
            .await
    }

    async fn bind(&self) -> io::Result<UdpSocket> {
        let local: SocketAddr = if self.server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        debug!(local = %socket.local_addr()?, server = %self.server, "client socket bound");
        Ok(socket)
    }
}

fn check_name(name: &str) -> Result<String, TransferError> {
    if name.is_empty() || name.contains('\0') {
        return Err(TransferError::Protocol(format!("illegal filename {name:?}")));
    }
    Ok(name.to_string())
}
