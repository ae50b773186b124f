use clap::Parser;
use coinfall_server::config::RoomConfig;
use coinfall_server::host::RoomHost;
use coinfall_server::network::Server;
use coinfall_server::profile::{Catalog, MemoryProfileStore};
use coinfall_server::storage::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Main-method of the room server.
/// Parses command-line arguments, starts the room actor and serves WebSocket connections.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value = "8080")]
        port: u16,
        /// File the room snapshot is persisted to; kept in memory when omitted
        #[clap(short, long)]
        snapshot: Option<PathBuf>,
        /// Extra origin allowed to open sockets, may be repeated
        #[clap(long = "allow-origin")]
        allow_origin: Vec<String>,
        /// Hard ceiling on open sockets
        #[clap(short, long, default_value = "20")]
        max_connections: usize,
        /// Seconds of inactivity before the room is evicted from memory, 0 disables
        #[clap(long, default_value = "0")]
        hibernate_after: u64,
    }

    env_logger::init();
    let args = Args::parse();

    let config = RoomConfig {
        max_connections: args.max_connections,
        ..RoomConfig::default()
    };

    let snapshots: Arc<dyn SnapshotStore> = match &args.snapshot {
        Some(path) => {
            info!("Persisting room snapshots to {}", path.display());
            Arc::new(FileSnapshotStore::new(path))
        }
        None => Arc::new(MemorySnapshotStore::new()),
    };
    let profiles = Arc::new(MemoryProfileStore::new(Catalog::default()));
    let hibernate_after = (args.hibernate_after > 0).then(|| Duration::from_secs(args.hibernate_after));

    let mailbox = RoomHost::new(config, snapshots, profiles, hibernate_after).spawn();

    let address = format!("{}:{}", args.host, args.port);
    let server = Server::bind(&address, mailbox, args.max_connections, args.allow_origin).await?;

    // Handle shutdown gracefully
    tokio::select! {
        result = server.run() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
