use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rand::RngCore;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use torc::{
    BincodeSnapshotStore, DiscardSnapshots, Identifier, Node, NodeConfig, NodeRef, SeedDiscovery,
    SnapshotStore, StaticSeeds, UdpLineTransport,
};

#[derive(Clone, Debug)]
struct BootstrapPeer {
    peer: NodeRef,
}

impl FromStr for BootstrapPeer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr_part, id_part) = s
            .rsplit_once('/')
            .context("bootstrap peer must include an identifier (format: IP:PORT/IDHEX)")?;

        let addr: SocketAddr = addr_part.parse().context("invalid socket address")?;
        let id = Identifier::from_hex(id_part).context("invalid hex identifier")?;

        Ok(BootstrapPeer { peer: NodeRef::with_addr(id, addr) })
    }
}

#[derive(Parser, Debug)]
#[command(name = "torc")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// UDP address to listen on.
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Known ring members (IP:PORT/IDHEX). The first entry is the join
    /// seed; every entry becomes routable by identifier.
    #[arg(short = 'B', long = "bootstrap", value_name = "PEER")]
    bootstrap: Vec<BootstrapPeer>,

    /// Pin the node identifier (128 hex chars) instead of generating one.
    #[arg(long, value_name = "IDHEX")]
    identity: Option<String>,

    /// Milliseconds between stabilization rounds.
    #[arg(long, default_value = "2000")]
    stabilize_interval: u64,

    /// Milliseconds between finger-repair rounds.
    #[arg(long, default_value = "1000")]
    fix_fingers_interval: u64,

    /// Seconds between ring status log lines.
    #[arg(short, long, default_value = "300")]
    status_interval: u64,

    /// Where to persist routing snapshots; omitted means no persistence.
    #[arg(long, value_name = "PATH")]
    snapshot: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let id = match &args.identity {
        Some(pinned) => Identifier::from_hex(pinned).context("invalid --identity")?,
        None => {
            let mut seed = [0u8; 64];
            rand::rngs::OsRng
                .try_fill_bytes(&mut seed)
                .context("identifier generation failed")?;
            Identifier::digest(&seed)
        }
    };

    let (transport, mut receiver) = UdpLineTransport::bind(id, args.bind).await?;
    let local_addr = transport.local_addr()?;
    let self_ref = NodeRef::with_addr(id, local_addr);
    info!("Node identity: {}", id);
    info!("Listening on {}", local_addr);

    // Configured peers are routable by identifier before any traffic
    // arrives; the rest of the address book fills from inbound datagrams.
    for entry in &args.bootstrap {
        if let Some(addr) = entry.peer.addr() {
            transport.learn(entry.peer.id(), addr).await;
        }
    }

    let snapshots: Arc<dyn SnapshotStore> = match &args.snapshot {
        Some(path) => {
            let store = BincodeSnapshotStore::new(path.clone());
            match store.load().await {
                Ok(Some(prior)) => {
                    let resolved =
                        prior.rows.iter().filter(|row| !row.candidates.is_empty()).count();
                    info!(
                        owner = %prior.owner.short(),
                        resolved_rows = resolved,
                        "previous routing snapshot found; rejoining fresh"
                    );
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "could not read previous snapshot"),
            }
            Arc::new(store)
        }
        None => Arc::new(DiscardSnapshots),
    };

    let config = NodeConfig {
        stabilize_interval: Some(Duration::from_millis(args.stabilize_interval)),
        fix_fingers_interval: Some(Duration::from_millis(args.fix_fingers_interval)),
    };
    let node = Node::spawn(self_ref, Arc::new(transport), snapshots, config);

    // Pump inbound datagrams into the dispatcher until the socket or the
    // actor goes away.
    let pump = {
        let node = node.clone();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok((from, line)) => {
                        if node.deliver(from, line).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "inbound socket error");
                        break;
                    }
                }
            }
        })
    };

    let seeds = StaticSeeds::new(args.bootstrap.iter().map(|b| b.peer).collect());
    let resolved = seeds.resolve_seeds().await?;
    if resolved.len() > 1 {
        info!(reserve = resolved.len() - 1, "joining via first seed");
    }
    match resolved.first().copied() {
        Some(seed) => {
            info!("Bootstrapping from {:?}", seed);
            node.join(Some(seed)).await?;
            match time::timeout(Duration::from_secs(30), node.joined()).await {
                Ok(()) => info!("Ring join complete"),
                Err(_) => warn!("Finger table still building; continuing in background"),
            }
        }
        None => {
            node.join(None).await?;
            info!("No seeds; started a fresh ring");
        }
    }

    let mut status = time::interval(Duration::from_secs(args.status_interval));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = status.tick() => {
                let snapshot = node.ring().await?;
                let successor = snapshot
                    .rows
                    .first()
                    .and_then(|row| row.candidates.first())
                    .map(|n| n.id().short())
                    .unwrap_or_default();
                let predecessor = snapshot
                    .predecessor
                    .map(|p| p.id().short())
                    .unwrap_or_default();
                let resolved_rows =
                    snapshot.rows.iter().filter(|row| !row.candidates.is_empty()).count();
                info!(
                    joined = node.is_joined(),
                    successor = %successor,
                    predecessor = %predecessor,
                    resolved_rows,
                    "ring status"
                );
            }
        }
    }

    node.quit().await;
    pump.abort();
    Ok(())
}
