//! `ecal-node` entrypoint: parses the cluster directory and this node's
//! local settings, brings up the socket-backed transport, constructs the
//! ECAL engine, and serves until SIGINT (§6 "process surface").

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use ec_cluster::ClusterDirectory;
use ec_degraded::DegradationState;
use ec_engine::{Engine, PoolRegion};
use ec_pool::BlockPool;
use ec_transport::tcp::{PeerAddr, TcpTransport};
use ec_types::Geometry;
use serde::Deserialize;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;

/// CLI arguments. The cluster directory and PM/transport layout are
/// node-local concerns, so only the bare minimum needed to find those
/// files lives on the command line (`ox-bin`'s `Args` follows the same
/// "path plus config override" shape).
#[derive(Parser, Debug)]
#[command(name = "ecal-node", version, about = "ECAL storage engine node")]
struct Args {
    /// This node's id, must appear in the cluster directory.
    #[arg(long)]
    id: u32,

    /// Path to the plain-text cluster directory (§6).
    #[arg(long = "cluster-config")]
    cluster_config: Option<PathBuf>,

    /// Path to this node's local TOML settings (PM file, geometry, logging).
    #[arg(long = "settings", default_value = "ecal-node.toml")]
    settings: PathBuf,
}

/// Node-local settings, deserialized with `toml`+`serde` (§2.3): the parts
/// of this node's configuration the plain-text cluster directory grammar
/// has no room for.
#[derive(Debug, Deserialize)]
struct NodeSettingsFile {
    #[serde(default = "default_log_dir")]
    log_dir: PathBuf,
    pm_file: PathBuf,
    #[serde(default = "default_pool_capacity_rows")]
    pool_capacity_rows: u64,
    #[serde(default = "default_write_log_cap")]
    write_log_cap: usize,
    geometry: GeometrySettings,
}

#[derive(Debug, Deserialize)]
struct GeometrySettings {
    k: usize,
    p: usize,
    block_bytes: usize,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_pool_capacity_rows() -> u64 {
    1 << 16
}

fn default_write_log_cap() -> usize {
    ec_types::DEFAULT_WRITE_LOG_CAP
}

fn load_settings(path: &Path) -> Result<NodeSettingsFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading node settings from {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parsing node settings in {}", path.display()))
}

struct AppStartup {
    log_guard: Option<WorkerGuard>,
}

impl AppStartup {
    fn new() -> Self {
        Self { log_guard: None }
    }

    /// Mirrors `ox_bin::AppStartup::configure_logging`: a non-blocking file
    /// appender plus an env-filtered fmt layer, with the `WorkerGuard` held
    /// for the process lifetime so buffered lines are flushed on exit.
    fn configure_logging(&mut self, log_dir: &Path, node_id: u32) -> Result<()> {
        std::fs::create_dir_all(log_dir).with_context(|| format!("creating log dir {}", log_dir.display()))?;
        let file_name = format!("ecal-node-{node_id}.log");
        let log_path = log_dir.join(&file_name);
        if log_path.exists() {
            let _ = std::fs::remove_file(&log_path);
        }

        let file_appender = tracing_appender::rolling::never(log_dir, &file_name);
        let (nb_writer, guard) = tracing_appender::non_blocking(file_appender);
        match tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(nb_writer)
            .try_init()
        {
            Ok(_) => self.log_guard = Some(guard),
            Err(_) => {
                // Global subscriber already installed (e.g. under a test harness).
            }
        }
        Ok(())
    }

    fn install_panic_hook() {
        let default_panic = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            tracing::error!(target: "runtime.panic", ?info, "panic");
            default_panic(info);
        }));
    }
}

fn parse_socket_addr(raw: &str, role: &str) -> Result<SocketAddr> {
    raw.parse()
        .with_context(|| format!("node {role} address {raw:?} is not a valid host:port"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = load_settings(&args.settings)?;

    let mut startup = AppStartup::new();
    startup.configure_logging(&settings.log_dir, args.id)?;
    AppStartup::install_panic_hook();

    info!(target: "runtime", node = args.id, "startup");

    let cluster_config_path = ec_cluster::discover(args.cluster_config.as_deref());
    let cluster_contents = std::fs::read_to_string(&cluster_config_path)
        .with_context(|| format!("reading cluster config from {}", cluster_config_path.display()))?;
    let directory = ClusterDirectory::parse(&cluster_contents, args.id)?;

    let geometry = Geometry::new(
        settings.geometry.k,
        settings.geometry.p,
        settings.geometry.block_bytes,
        directory.cluster_size(),
    )?;

    let pool = Arc::new(BlockPool::open_file(
        &settings.pm_file,
        settings.pool_capacity_rows,
        geometry.fragment_bytes(),
    )?);

    let listen_addr = parse_socket_addr(&directory.myself().transport_address, "self")?;
    let peer_addrs = directory
        .nodes()
        .iter()
        .filter(|n| n.id != args.id)
        .map(|n| {
            Ok(PeerAddr {
                id: n.id,
                addr: parse_socket_addr(&n.transport_address, "peer")?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let degraded = Arc::new(DegradationState::with_capacity(settings.write_log_cap));
    let local_region = Arc::new(PoolRegion::new(pool.clone()));

    info!(target: "transport", node = args.id, peers = peer_addrs.len(), %listen_addr, "binding transport");
    let transport = TcpTransport::bind(args.id, listen_addr, peer_addrs, local_region, degraded.clone())
        .context("bringing up the remote memory transport")?;

    // The engine is this node's entry point for originating reads/writes;
    // nothing in this process calls it yet, since the client-facing
    // path-to-block facade is out of scope (§1). Peer-initiated fragment
    // I/O is serviced by the transport's own reader threads against
    // `local_region` above. Held here so a future RPC-dispatch layer has
    // it ready without re-threading the pool/directory/transport wiring.
    let _engine: Engine<_> = Engine::new(geometry, directory, pool, transport.clone(), degraded);

    info!(target: "runtime", node = args.id, "serving until SIGINT");
    tokio::signal::ctrl_c().await.context("waiting for SIGINT")?;

    info!(target: "runtime", node = args.id, "shutdown");
    transport.shutdown();
    warn!(target: "runtime", node = args.id, "stopped");
    Ok(())
}
