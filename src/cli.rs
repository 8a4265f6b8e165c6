use anstyle::AnsiColor;
use clap::builder::styling::Styles;
use clap::{Args, Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::server::ServerConfig;
use crate::transfer::TransferConfig;
use crate::{DEF_PORT, DEF_RETRY_COUNT, DEF_TIMEOUT_MS};

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default())
    .usage(AnsiColor::Green.on_default())
    .literal(AnsiColor::Cyan.on_default())
    .placeholder(AnsiColor::Red.on_default());

#[derive(Parser, Debug)]
#[command(name = "tftp")]
#[command(about = "A simple TFTP client/server", long_about = None)]
#[command(styles = STYLES)]
pub struct Cli {
    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve files from a directory
    Serve(ServeArgs),
    /// Download a file from a server
    Get(TransferArgs),
    /// Upload a file to a server
    Put(TransferArgs),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Listen ip
    #[arg(short, long, default_value = "0.0.0.0")]
    pub ip: IpAddr,

    /// Listen Port
    #[arg(short, long, default_value_t = DEF_PORT)]
    pub port: u16,

    /// Work directory
    #[arg(short, long, default_value = ".")]
    pub directory: PathBuf,

    /// Refuse write requests
    #[arg(long)]
    pub read_only: bool,

    #[command(flatten)]
    pub timing: TimingArgs,
}

#[derive(Args, Debug)]
pub struct TransferArgs {
    /// Server host name or ip
    pub host: String,

    /// File name on the server
    pub remote: String,

    /// Local file, defaults to the remote file name
    pub local: Option<PathBuf>,

    /// Server Port
    #[arg(short, long, default_value_t = DEF_PORT)]
    pub port: u16,

    #[command(flatten)]
    pub timing: TimingArgs,
}

#[derive(Args, Debug)]
pub struct TimingArgs {
    /// Timeout (ms)
    #[arg(short, long, default_value_t = DEF_TIMEOUT_MS)]
    pub timeout: u64,

    /// Max retries
    #[arg(short, long, default_value_t = DEF_RETRY_COUNT)]
    pub retry: u8,
}

impl TimingArgs {
    pub fn config(&self) -> TransferConfig {
        TransferConfig {
            timeout: Duration::from_millis(self.timeout),
            retries: self.retry,
            ..TransferConfig::default()
        }
    }
}

impl ServeArgs {
    pub fn config(&self) -> ServerConfig {
        ServerConfig {
            listen: SocketAddr::new(self.ip, self.port),
            read_only: self.read_only,
            transfer: self.timing.config(),
        }
    }
}

impl TransferArgs {
    pub fn local_path(&self) -> PathBuf {
        match &self.local {
            Some(path) => path.clone(),
            None => Path::new(&self.remote)
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(&self.remote)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_defaults() {
        let cli = Cli::try_parse_from(["tftp", "serve"]).unwrap();
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let config = args.config();
        assert_eq!(config.listen, "0.0.0.0:69".parse().unwrap());
        assert!(!config.read_only);
        assert_eq!(config.transfer, TransferConfig::default());
    }

    #[test]
    fn serve_flags() {
        let cli = Cli::try_parse_from([
            "tftp", "-v", "serve", "-i", "127.0.0.1", "-p", "6969", "-t", "250", "-r", "5",
            "--read-only",
        ])
        .unwrap();
        assert!(cli.verbose);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let config = args.config();
        assert_eq!(config.listen, "127.0.0.1:6969".parse().unwrap());
        assert!(config.read_only);
        assert_eq!(config.transfer.timeout, Duration::from_millis(250));
        assert_eq!(config.transfer.retries, 5);
    }

    #[test]
    fn get_defaults_local_to_remote_basename() {
        let cli = Cli::try_parse_from(["tftp", "get", "server", "boot/pxelinux.0"]).unwrap();
        let Command::Get(args) = cli.command else {
            panic!("expected get");
        };
        assert_eq!(args.port, DEF_PORT);
        assert_eq!(args.local_path(), PathBuf::from("pxelinux.0"));
    }

    #[test]
    fn put_with_explicit_local() {
        let cli =
            Cli::try_parse_from(["tftp", "put", "10.0.0.1", "up.bin", "./local.bin", "-p", "69"])
                .unwrap();
        let Command::Put(args) = cli.command else {
            panic!("expected put");
        };
        assert_eq!(args.local_path(), PathBuf::from("./local.bin"));
        assert_eq!(args.host, "10.0.0.1");
    }

    #[test]
    fn missing_subcommand_is_an_error() {
        assert!(Cli::try_parse_from(["tftp"]).is_err());
    }
}
