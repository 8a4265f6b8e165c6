use anyhow::{anyhow, Context};
use clap::Parser;
use std::fs::{self, File};
use std::net::SocketAddr;
use tokio::net::lookup_host;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tftp::{Cli, Client, Command, FsStorage, ServeArgs, Server, TransferArgs, TransferStats};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    let level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match args.command {
        Command::Serve(args) => serve(args).await,
        Command::Get(args) => get(args).await,
        Command::Put(args) => put(args).await,
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let workdir = args
        .directory
        .canonicalize()
        .with_context(|| format!("work directory {}", args.directory.display()))?;
    info!("workdir: {}", workdir.display());

    let server = Server::bind(args.config(), FsStorage::new(workdir)).await?;
    server.run().await?;
    Ok(())
}

async fn get(args: TransferArgs) -> anyhow::Result<()> {
    let client = Client::new(resolve(&args).await?, args.timing.config());
    let local = args.local_path();
    let mut file =
        File::create(&local).with_context(|| format!("cannot create {}", local.display()))?;

    match client.get(&args.remote, &mut file).await {
        Ok(stats) => {
            summary("received", &args.remote, &stats);
            Ok(())
        }
        Err(e) => {
            drop(file);
            if let Err(rm) = fs::remove_file(&local) {
                warn!("cannot remove partial {}: {rm}", local.display());
            }
            Err(e).with_context(|| format!("download of {} failed", args.remote))
        }
    }
}

async fn put(args: TransferArgs) -> anyhow::Result<()> {
    let client = Client::new(resolve(&args).await?, args.timing.config());
    let local = args.local_path();
    let mut file = File::open(&local).with_context(|| format!("cannot open {}", local.display()))?;

    let stats = client
        .put(&args.remote, &mut file)
        .await
        .with_context(|| format!("upload of {} failed", local.display()))?;
    summary("sent", &args.remote, &stats);
    Ok(())
}

async fn resolve(args: &TransferArgs) -> anyhow::Result<SocketAddr> {
    lookup_host((args.host.as_str(), args.port))
        .await?
        .next()
        .ok_or(anyhow!("cannot resolve {}", args.host))
}

fn summary(verb: &str, name: &str, stats: &TransferStats) {
    info!(
        "{verb} {name}: {} bytes in {} blocks, {} retransmits, cost: {:.3}s, speed: {:.2} MB/s",
        stats.bytes,
        stats.blocks,
        stats.retransmits,
        stats.elapsed.as_secs_f64(),
        stats.speed()
    );
}
