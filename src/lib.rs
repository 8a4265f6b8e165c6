mod block;
pub mod channel;
mod cli;
mod client;
pub mod packet;
mod server;
pub mod storage;
pub mod transfer;

pub use crate::block::Block;
pub use crate::cli::{Cli, Command, ServeArgs, TimingArgs, TransferArgs};
pub use crate::client::Client;
pub use crate::packet::{DecodeError, ErrorCode, TftpPacket};
pub use crate::server::{Server, ServerConfig};
pub use crate::storage::{FsStorage, Storage, StorageError};
pub use crate::transfer::{Peer, Transfer, TransferConfig, TransferError, TransferStats};

pub const BLOCK_SIZE: usize = 512; // RFC 1350
pub const MODE_OCTET: &str = "octet";
pub const DEF_PORT: u16 = 69;

pub const DEF_TIMEOUT_MS: u64 = 1000;
pub const DEF_RETRY_COUNT: u8 = 3;

// Large enough that an oversized datagram is seen whole and rejected.
pub const RECV_BUFFER_SIZE: usize = 2048;
