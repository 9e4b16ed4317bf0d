use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::net::lookup_host;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use reliable_multicast::config::{host_id, read_hostfile, Config};
use reliable_multicast::multicast::{MulticastEngine, ProcessId};
use reliable_multicast::snapshot::SnapshotCoordinator;
use reliable_multicast::transport::net::{TcpMarkerChannel, UdpTransport};
use reliable_multicast::MulticastError;

const MULTICAST_PORT: u16 = 4646;
const MARKER_PORT: u16 = 4647;

/// Total-order reliable multicast node with an optional global snapshot.
#[derive(Parser, Debug)]
struct Args {
    /// Hostfile with one hostname per line, identical on every node.
    #[arg(short = 'H', long)]
    hostfile: PathBuf,

    /// Number of data messages to multicast from this node.
    #[arg(short, long)]
    count: u64,

    /// This node's hostname; defaults to $HOSTNAME.
    #[arg(long)]
    name: Option<String>,

    /// Probability in [0, 1) of artificially dropping an outgoing frame.
    #[arg(long, default_value_t = 0.0)]
    drop_rate: f64,

    /// Artificial delay in milliseconds before every send.
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,

    /// Retransmission watchdog timeout in milliseconds.
    #[arg(long, default_value_t = 3000)]
    timeout_ms: u64,

    /// Initiate a global snapshot after this many multicasts.
    #[arg(long)]
    snapshot_after: Option<u64>,

    /// Stop the receive loop after this many inbound frames.
    #[arg(long)]
    recv_cap: Option<u64>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run(Args::parse()).await {
        error!(%err, "exiting");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> reliable_multicast::Result<()> {
    let hosts = read_hostfile(&args.hostfile)?;
    let self_name = match args.name.or_else(|| std::env::var("HOSTNAME").ok()) {
        Some(name) => name,
        None => {
            return Err(MulticastError::Config(
                "no --name given and $HOSTNAME unset".into(),
            ))
        }
    };
    let self_id = host_id(&self_name).ok_or_else(|| {
        MulticastError::Config(format!("hostname {self_name:?} carries no process id"))
    })?;
    info!(self_name, self_id, hosts = hosts.len(), "starting up");

    let mut cfg = Config::new(self_id, hosts.iter().map(|(id, _)| *id).collect());
    cfg.drop_rate = args.drop_rate;
    cfg.delay = Duration::from_millis(args.delay_ms);
    cfg.watchdog_timeout = Duration::from_millis(args.timeout_ms);
    if let Some(cap) = args.recv_cap {
        cfg.recv_cap = cap;
    }

    let data_addrs = resolve(&hosts, MULTICAST_PORT).await?;
    let marker_addrs = resolve(&hosts, MARKER_PORT).await?;
    let transport =
        UdpTransport::bind(SocketAddr::from(([0, 0, 0, 0], MULTICAST_PORT)), data_addrs).await?;
    let markers =
        TcpMarkerChannel::bind(SocketAddr::from(([0, 0, 0, 0], MARKER_PORT)), marker_addrs).await?;

    let engine = MulticastEngine::new(cfg, transport)?;
    let engine_loop = engine.clone();
    let engine_task = tokio::spawn(async move { engine_loop.run().await });

    let mut coordinator = SnapshotCoordinator::new(engine.clone(), markers);
    let mut initiated = false;
    for i in 0..args.count {
        if args.snapshot_after == Some(i) {
            coordinator.initiate().await?;
            initiated = true;
        }
        // arbitrary but reproducible payloads
        engine.multicast((i as u32).wrapping_mul(198) % 27).await?;
    }
    if !initiated && args.snapshot_after.is_some() {
        coordinator.initiate().await?;
        initiated = true;
    }

    // Non-initiators park here waiting for a marker that may never come;
    // the task is reaped or aborted below once the receive loop ends.
    let snapshot_task = tokio::spawn(async move {
        match coordinator.run().await {
            Ok(snapshot) => println!("{snapshot}"),
            Err(err) => error!(%err, "snapshot collection failed"),
        }
    });

    match engine_task.await {
        Ok(result) => result?,
        Err(err) => return Err(MulticastError::Transport(io::Error::other(err))),
    }
    info!("receive loop finished");

    if initiated {
        let _ = tokio::time::timeout(Duration::from_secs(10), snapshot_task).await;
    } else {
        // give a peer-initiated snapshot a moment to finish collecting
        match tokio::time::timeout(Duration::from_secs(1), snapshot_task).await {
            Ok(_) => {}
            Err(_) => info!("no snapshot in progress"),
        }
    }
    engine.shutdown();
    Ok(())
}

async fn resolve(
    hosts: &[(ProcessId, String)],
    port: u16,
) -> reliable_multicast::Result<HashMap<ProcessId, SocketAddr>> {
    let mut addrs = HashMap::new();
    for (id, name) in hosts {
        let addr = lookup_host((name.as_str(), port))
            .await?
            .next()
            .ok_or_else(|| MulticastError::Config(format!("cannot resolve host {name:?}")))?;
        addrs.insert(*id, addr);
    }
    Ok(addrs)
}
