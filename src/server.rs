//! Request dispatcher.
//!
//! The server owns the well-known port and only ever looks at requests
//! there. Every accepted request gets its own socket and task, so a
//! misbehaving client can only take down its own transfer.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::packet::{ErrorCode, TftpPacket};
use crate::storage::{ByteSink, ByteSource, Storage, StorageError};
use crate::transfer::{Peer, Transfer, TransferConfig, TransferError, TransferStats};
use crate::{DEF_PORT, MODE_OCTET, RECV_BUFFER_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Refuse write requests.
    pub read_only: bool,
    pub transfer: TransferConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEF_PORT),
            read_only: false,
            transfer: TransferConfig::default(),
        }
    }
}

pub struct Server<S> {
    socket: UdpSocket,
    storage: Arc<S>,
    config: ServerConfig,
}

impl<S: Storage> Server<S> {
    pub async fn bind(config: ServerConfig, storage: S) -> io::Result<Self> {
        let socket = UdpSocket::bind(config.listen).await?;
        Ok(Self {
            socket,
            storage: Arc::new(storage),
            config,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Accepts requests forever. Transfers run on their own tasks and never
    /// block this loop.
    pub async fn run(self) -> io::Result<()> {
        info!(
            addr = %self.socket.local_addr()?,
            read_only = self.config.read_only,
            timeout_ms = self.config.transfer.timeout.as_millis() as u64,
            retry = self.config.transfer.retries,
            "TFTP server listening"
        );

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            let (num, addr) = match self.socket.recv_from(&mut buf).await {
                Ok(res) => res,
                Err(e) => {
                    warn!("receive on listener failed: {e}");
                    continue;
                }
            };
            self.dispatch(&buf[..num], addr).await;
        }
    }

    async fn dispatch(&self, datagram: &[u8], addr: SocketAddr) {
        let pkt = match TftpPacket::deserialize(datagram) {
            Ok(pkt) => pkt,
            Err(e) => {
                debug!(%addr, "malformed request: {e}");
                self.reject(addr, ErrorCode::ILLEGAL_OPERATION, "Illegal TFTP operation")
                    .await;
                return;
            }
        };
        info!("{addr} {pkt:?}");

        match pkt {
            TftpPacket::RRQ { filename, mode } => self.read_request(addr, filename, mode).await,
            TftpPacket::WRQ { filename, mode } => self.write_request(addr, filename, mode).await,
            // Errors are never answered.
            TftpPacket::ERROR { code, msg } => debug!(%addr, %code, "dropping error: {msg}"),
            _ => {
                self.reject(addr, ErrorCode::ILLEGAL_OPERATION, "Illegal TFTP operation")
                    .await
            }
        }
    }

    async fn read_request(&self, peer: SocketAddr, filename: String, mode: String) {
        if !mode.eq_ignore_ascii_case(MODE_OCTET) {
            let msg = format!("Unsupported '{mode}' mode");
            return self.reject(peer, ErrorCode::NOT_DEFINED, msg).await;
        }
        let source = match self.storage.open_read(&filename) {
            Ok(source) => source,
            Err(e) => return self.reject_storage(peer, e).await,
        };

        let bind = self.transfer_addr();
        let config = self.config.transfer;
        tokio::spawn(async move {
            let res = serve_read(bind, peer, config, source).await;
            report(peer, "read", &filename, res);
        });
    }

    async fn write_request(&self, peer: SocketAddr, filename: String, mode: String) {
        if self.config.read_only {
            return self
                .reject(peer, ErrorCode::ACCESS_VIOLATION, "Server is read-only")
                .await;
        }
        if !mode.eq_ignore_ascii_case(MODE_OCTET) {
            let msg = format!("Unsupported '{mode}' mode");
            return self.reject(peer, ErrorCode::NOT_DEFINED, msg).await;
        }
        let sink = match self.storage.open_write(&filename) {
            Ok(sink) => sink,
            Err(e) => return self.reject_storage(peer, e).await,
        };

        let bind = self.transfer_addr();
        let config = self.config.transfer;
        let storage = Arc::clone(&self.storage);
        tokio::spawn(async move {
            let res = serve_write(bind, peer, config, sink).await;
            if res.is_err() {
                // The sink is closed by now; drop what was written.
                if let Err(e) = storage.remove(&filename) {
                    warn!(%peer, filename, "failed to discard partial upload: {e}");
                }
            }
            report(peer, "write", &filename, res);
        });
    }

    // Each transfer talks from a fresh ephemeral port on the listening address.
    fn transfer_addr(&self) -> SocketAddr {
        let ip = self
            .socket
            .local_addr()
            .map(|addr| addr.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        SocketAddr::new(ip, 0)
    }

    async fn reject_storage(&self, peer: SocketAddr, e: StorageError) {
        let code = match e {
            StorageError::NotFound(_) => ErrorCode::FILE_NOT_FOUND,
            StorageError::AlreadyExists(_) => ErrorCode::FILE_EXISTS,
            StorageError::AccessDenied(_) | StorageError::InvalidName(_) => {
                ErrorCode::ACCESS_VIOLATION
            }
            StorageError::Io(_) => ErrorCode::NOT_DEFINED,
        };
        self.reject(peer, code, e.to_string()).await
    }

    async fn reject(&self, peer: SocketAddr, code: ErrorCode, msg: impl Into<String>) {
        let pkt = TftpPacket::error(code, msg);
        debug!(%peer, "rejecting request: {pkt:?}");
        if let Err(e) = self.socket.send_to(&pkt.serialize(), peer).await {
            warn!(%peer, "failed to send error: {e}");
        }
    }
}

async fn serve_read<R>(
    bind: SocketAddr,
    peer: SocketAddr,
    config: TransferConfig,
    mut source: R,
) -> Result<TransferStats, TransferError>
where
    R: ByteSource + Send,
{
    let socket = UdpSocket::bind(bind).await?;
    Transfer::new(&socket, Peer::locked(peer), config)
        .send(&mut source, None)
        .await
}

async fn serve_write<W>(
    bind: SocketAddr,
    peer: SocketAddr,
    config: TransferConfig,
    mut sink: W,
) -> Result<TransferStats, TransferError>
where
    W: ByteSink + Send,
{
    let socket = UdpSocket::bind(bind).await?;
    Transfer::new(&socket, Peer::locked(peer), config)
        .receive(&mut sink, TftpPacket::ACK(0))
        .await
}

fn report(peer: SocketAddr, kind: &str, filename: &str, res: Result<TransferStats, TransferError>) {
    match res {
        Ok(stats) => info!(
            %peer,
            filename,
            blocks = stats.blocks,
            retransmits = stats.retransmits,
            "{kind} done, cost: {:.3}s, speed: {:.2} MB/s",
            stats.elapsed.as_secs_f64(),
            stats.speed()
        ),
        Err(e) => warn!(%peer, filename, "{kind} failed: {e}"),
    }
}
