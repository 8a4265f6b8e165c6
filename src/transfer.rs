//! Stop-and-wait transfer engine.
//!
//! A [`Transfer`] drives one file transfer against one peer over a
//! [`DatagramChannel`]. The same engine runs both ends of the protocol:
//! [`Transfer::send`] is the data sender (server answering a read request,
//! client uploading) and [`Transfer::receive`] the data receiver (server
//! accepting a write request, client downloading).
//!
//! Exactly one packet is outstanding at a time. Only transport faults are
//! retried, by resending the identical last packet when the timeout fires;
//! every other fault ends the transfer.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::block::Block;
use crate::channel::{ChannelError, DatagramChannel};
use crate::packet::{ErrorCode, TftpPacket};
use crate::storage::{ByteSink, ByteSource};
use crate::{BLOCK_SIZE, DEF_RETRY_COUNT, DEF_TIMEOUT_MS, RECV_BUFFER_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    /// How long to wait for the peer before resending.
    pub timeout: Duration,
    /// Resends allowed for one packet before giving up.
    pub retries: u8,
    /// Linger one timeout after the final ack to answer a resent last block.
    pub dally: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEF_TIMEOUT_MS),
            retries: DEF_RETRY_COUNT,
            dally: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("peer error: {code}: {message}")]
    Peer { code: ErrorCode, message: String },

    #[error("transfer timed out after {attempts} attempts")]
    TimeoutExceeded { attempts: u32 },

    #[error("storage failure: {0}")]
    Storage(#[source] io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransferError {
    // Error packet owed to the peer when a local fault ends the transfer.
    fn courtesy(&self) -> Option<TftpPacket> {
        match self {
            TransferError::Protocol(msg) => {
                Some(TftpPacket::error(ErrorCode::ILLEGAL_OPERATION, msg.clone()))
            }
            TransferError::Storage(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                Some(TftpPacket::error(ErrorCode::ACCESS_VIOLATION, e.to_string()))
            }
            TransferError::Storage(e) => {
                Some(TftpPacket::error(ErrorCode::NOT_DEFINED, e.to_string()))
            }
            _ => None,
        }
    }
}

/// Remote end of a transfer.
///
/// An unlocked peer is a server's well-known port: the first valid reply
/// from the same host fixes the address the rest of the transfer talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    addr: SocketAddr,
    locked: bool,
}

impl Peer {
    pub fn locked(addr: SocketAddr) -> Self {
        Self { addr, locked: true }
    }

    pub fn unlocked(addr: SocketAddr) -> Self {
        Self {
            addr,
            locked: false,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn accepts(&self, from: SocketAddr) -> bool {
        if self.locked {
            from == self.addr
        } else {
            from.ip() == self.addr.ip()
        }
    }

    fn lock(&mut self, from: SocketAddr) {
        if !self.locked {
            self.addr = from;
            self.locked = true;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub blocks: u64,
    pub bytes: u64,
    pub retransmits: u32,
    pub elapsed: Duration,
}

impl TransferStats {
    /// Payload throughput in MB/s.
    pub fn speed(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.bytes as f64 / secs / 1024.0 / 1024.0
    }

    fn record(&mut self, len: usize) {
        self.blocks += 1;
        self.bytes += len as u64;
    }
}

enum Reply {
    Accept,
    Ignore,
    Unexpected,
}

pub struct Transfer<'c, C: ?Sized> {
    channel: &'c C,
    peer: Peer,
    config: TransferConfig,
    buf: Vec<u8>,
    retries: u8,
    stats: TransferStats,
    start: Instant,
    // Error from the well-known port that may only answer a resent request.
    deferred: Option<TransferError>,
}

impl<'c, C: DatagramChannel + ?Sized> Transfer<'c, C> {
    pub fn new(channel: &'c C, peer: Peer, config: TransferConfig) -> Self {
        Self {
            channel,
            peer,
            config,
            buf: vec![0; RECV_BUFFER_SIZE],
            retries: 0,
            stats: TransferStats::default(),
            start: Instant::now(),
            deferred: None,
        }
    }

    /// Sends `source` to the peer block by block.
    ///
    /// With `request` set (a client upload), the request is sent first and
    /// must be answered with `ACK 0` before the first block goes out.
    pub async fn send<S>(
        mut self,
        source: &mut S,
        request: Option<TftpPacket>,
    ) -> Result<TransferStats, TransferError>
    where
        S: ByteSource + Send + ?Sized,
    {
        if let Some(request) = request {
            let bytes = request.serialize();
            self.transmit(&bytes, |pkt| match pkt {
                TftpPacket::ACK(0) => Reply::Accept,
                TftpPacket::ACK(_) => Reply::Ignore,
                _ => Reply::Unexpected,
            })
            .await?;
        }

        let mut block = Block::FIRST;
        loop {
            let data = match source.read_chunk(BLOCK_SIZE) {
                Ok(data) => data,
                Err(e) => return Err(self.abort(TransferError::Storage(e)).await),
            };
            let len = data.len();
            let expected = block.get();
            let bytes = TftpPacket::DATA {
                block: expected,
                data,
            }
            .serialize();

            self.transmit(&bytes, |pkt| match pkt {
                TftpPacket::ACK(n) if *n == expected => Reply::Accept,
                TftpPacket::ACK(_) => Reply::Ignore,
                _ => Reply::Unexpected,
            })
            .await?;
            self.stats.record(len);

            if len < BLOCK_SIZE {
                return Ok(self.finish());
            }
            block = block.succ();
        }
    }

    /// Receives blocks from the peer into `sink`.
    ///
    /// `opening` starts the exchange: `ACK 0` when a server accepts a write
    /// request, or the `RRQ` itself for a client download. It is resent
    /// until the first block arrives.
    pub async fn receive<W>(
        mut self,
        sink: &mut W,
        opening: TftpPacket,
    ) -> Result<TransferStats, TransferError>
    where
        W: ByteSink + Send + ?Sized,
    {
        let mut last = opening.serialize();
        self.send_raw(&last).await?;

        let mut expected = Block::FIRST;
        let mut received_any = false;
        let mut deadline = self.arm();
        loop {
            let Some((pkt, from)) = self.recv(deadline).await? else {
                self.retransmit(&last).await?;
                deadline = self.arm();
                continue;
            };

            match pkt {
                TftpPacket::DATA { block, data } if block == expected.get() => {
                    self.lock_peer(from);
                    if let Err(e) = sink.append(&data) {
                        return Err(self.abort(TransferError::Storage(e)).await);
                    }
                    last = TftpPacket::ACK(block).serialize();
                    self.send_raw(&last).await?;
                    self.retries = 0;
                    self.stats.record(data.len());
                    received_any = true;
                    expected = expected.succ();

                    if data.len() < BLOCK_SIZE {
                        self.dally(&last, block).await;
                        return Ok(self.finish());
                    }
                    deadline = self.arm();
                }
                TftpPacket::DATA { block, .. }
                    if received_any && block == expected.pred().get() =>
                {
                    // Our ack was lost; acknowledge again but never rewrite.
                    debug!(peer = %self.peer.addr, "duplicate block #{block}, re-acking");
                    self.send_raw(&TftpPacket::ACK(block).serialize()).await?;
                }
                TftpPacket::DATA { block, .. } => {
                    trace!(peer = %self.peer.addr, "discarding block #{block}, expected {expected}");
                }
                other => {
                    self.lock_peer(from);
                    let err = TransferError::Protocol(format!("unexpected {other:?}"));
                    return Err(self.abort(err).await);
                }
            }
        }
    }

    // Sends `bytes` and waits for a reply `accept` takes, resending on timeout.
    async fn transmit<F>(&mut self, bytes: &[u8], accept: F) -> Result<(), TransferError>
    where
        F: Fn(&TftpPacket) -> Reply + Send,
    {
        self.send_raw(bytes).await?;
        self.retries = 0;
        let mut deadline = self.arm();
        loop {
            let Some((pkt, from)) = self.recv(deadline).await? else {
                self.retransmit(bytes).await?;
                deadline = self.arm();
                continue;
            };
            match accept(&pkt) {
                Reply::Accept => {
                    self.lock_peer(from);
                    return Ok(());
                }
                // Stale acks keep the current deadline.
                Reply::Ignore => trace!(%from, "ignoring {pkt:?}"),
                Reply::Unexpected => {
                    self.lock_peer(from);
                    let err = TransferError::Protocol(format!("unexpected {pkt:?}"));
                    return Err(self.abort(err).await);
                }
            }
        }
    }

    async fn retransmit(&mut self, bytes: &[u8]) -> Result<(), TransferError> {
        if self.retries >= self.config.retries {
            if let Some(err) = self.deferred.take() {
                return Err(err);
            }
            return Err(TransferError::TimeoutExceeded {
                attempts: u32::from(self.retries) + 1,
            });
        }
        self.retries += 1;
        self.stats.retransmits += 1;
        debug!(peer = %self.peer.addr, retry = self.retries, "timeout, resending");
        self.send_raw(bytes).await
    }

    // After the final ack, answer a resent final block until the peer goes quiet.
    async fn dally(&mut self, ack: &[u8], last_block: u16) {
        if !self.config.dally {
            return;
        }
        let deadline = self.arm();
        loop {
            match self.recv(deadline).await {
                Ok(Some((TftpPacket::DATA { block, .. }, _))) if block == last_block => {
                    debug!(peer = %self.peer.addr, "final block resent, re-acking");
                    if self.send_raw(ack).await.is_err() {
                        return;
                    }
                }
                Ok(Some(_)) => (),
                _ => return,
            }
        }
    }

    /// Waits for the next packet from the peer until `deadline`.
    ///
    /// Returns `None` on timeout. Malformed datagrams are noise and are
    /// dropped; datagrams from a foreign endpoint get an `UNKNOWN_TID` error
    /// unless they are errors themselves. An `ERROR` from the peer ends the
    /// transfer. The caller locks the peer once it accepts a reply.
    async fn recv(
        &mut self,
        deadline: Instant,
    ) -> Result<Option<(TftpPacket, SocketAddr)>, TransferError> {
        loop {
            let wait = deadline.saturating_duration_since(Instant::now());
            if wait.is_zero() {
                return Ok(None);
            }
            let (len, from) = match self.channel.recv_timeout(&mut self.buf, wait).await {
                Ok(res) => res,
                Err(ChannelError::Timeout) => return Ok(None),
                Err(ChannelError::Io(e)) => return Err(TransferError::Io(e)),
            };

            let pkt = match TftpPacket::deserialize(&self.buf[..len]) {
                Ok(pkt) => pkt,
                Err(e) => {
                    debug!(%from, "dropping malformed datagram: {e}");
                    continue;
                }
            };

            if !self.peer.accepts(from) {
                // Errors are never answered.
                if let TftpPacket::ERROR { .. } = pkt {
                    debug!(peer = %self.peer.addr, %from, "dropping foreign {pkt:?}");
                    continue;
                }
                debug!(peer = %self.peer.addr, %from, "datagram from unknown transfer id");
                let reply = TftpPacket::error(ErrorCode::UNKNOWN_TID, "Unknown transfer ID");
                if let Err(e) = self.channel.send_datagram(&reply.serialize(), from).await {
                    debug!(%from, "failed to reject foreign datagram: {e}");
                }
                continue;
            }

            if let TftpPacket::ERROR { code, msg } = pkt {
                let err = TransferError::Peer { code, message: msg };
                if self.may_answer_resent_request(from) {
                    debug!(%from, "deferring {err}, the request was resent");
                    self.deferred = Some(err);
                    continue;
                }
                return Err(err);
            }
            return Ok(Some((pkt, from)));
        }
    }

    // Once a request has been resent, an error from the well-known port may
    // answer the duplicate while the transfer port's reply is still coming.
    fn may_answer_resent_request(&self, from: SocketAddr) -> bool {
        !self.peer.locked && self.stats.retransmits > 0 && from == self.peer.addr
    }

    // A held-back error is moot once the transfer port has answered.
    fn lock_peer(&mut self, from: SocketAddr) {
        self.peer.lock(from);
        self.deferred = None;
    }

    async fn send_raw(&self, bytes: &[u8]) -> Result<(), TransferError> {
        self.channel.send_datagram(bytes, self.peer.addr).await?;
        Ok(())
    }

    async fn abort(&mut self, err: TransferError) -> TransferError {
        if let Some(pkt) = err.courtesy() {
            if let Err(e) = self.channel.send_datagram(&pkt.serialize(), self.peer.addr).await {
                debug!(peer = %self.peer.addr, "failed to send error packet: {e}");
            }
        }
        err
    }

    fn arm(&self) -> Instant {
        Instant::now() + self.config.timeout
    }

    fn finish(mut self) -> TransferStats {
        self.stats.elapsed = self.start.elapsed();
        self.stats
    }
}
