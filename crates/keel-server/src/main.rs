mod admin;
mod link;
mod server;

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use keel_cluster::{parse_table, Cluster, ClusterConfig, NodeTableFile};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::server::Server;

#[derive(Parser)]
#[command(name = "keel-server", about = "keel cluster coordination node")]
struct Args {
    /// address to bind the cluster bus and admin listeners to
    #[arg(long, env = "KEEL_HOST", default_value = "127.0.0.1")]
    host: IpAddr,

    /// cluster bus port (also the port announced to peers)
    #[arg(short, long, env = "KEEL_PORT", default_value_t = 7000)]
    port: u16,

    /// admin command port. default: bus port + 1000
    #[arg(long, env = "KEEL_ADMIN_PORT")]
    admin_port: Option<u16>,

    /// directory holding the persisted node table
    #[arg(long, env = "KEEL_DATA_DIR", default_value = ".")]
    data_dir: PathBuf,

    /// milliseconds without a heartbeat reply before suspecting a peer
    #[arg(long, env = "KEEL_NODE_TIMEOUT", default_value_t = 15_000)]
    node_timeout: u64,

    /// coordination tick interval in milliseconds
    #[arg(long, env = "KEEL_TICK_INTERVAL", default_value_t = 100)]
    tick_interval: u64,

    /// minimum working replicas a primary keeps before donating one to an
    /// orphaned primary
    #[arg(long, env = "KEEL_MIGRATION_BARRIER", default_value_t = 1)]
    migration_barrier: usize,
}

// the whole coordination layer is a single-threaded event loop; nothing
// here needs more than one core
#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("KEEL_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ClusterConfig {
        node_timeout_ms: args.node_timeout,
        tick_interval_ms: args.tick_interval,
        migration_barrier: args.migration_barrier,
        ..ClusterConfig::default()
    };

    // the node table is loaded once and exclusively locked for the whole
    // process lifetime; any failure here is fatal
    let table_path = args.data_dir.join("nodes.tbl");
    let mut table = match NodeTableFile::open(&table_path) {
        Ok(table) => table,
        Err(err) => {
            error!(path = %table_path.display(), %err, "cannot open node table");
            return ExitCode::FAILURE;
        }
    };

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let cluster = match table.load() {
        Ok(Some(contents)) => match parse_table(&contents) {
            Ok(parsed) => Cluster::restore(config, args.port, &parsed, events_tx),
            Err(err) => {
                error!(%err, "node table is corrupt; refusing to start");
                return ExitCode::FAILURE;
            }
        },
        Ok(None) => Cluster::new(config, args.port, events_tx),
        Err(err) => {
            error!(%err, "cannot read node table");
            return ExitCode::FAILURE;
        }
    };

    let admin_port = args.admin_port.unwrap_or(args.port + 1000);
    info!(
        id = %cluster.myself_id(),
        bus = %format!("{}:{}", args.host, args.port),
        admin = %format!("{}:{}", args.host, admin_port),
        "starting"
    );

    match Server::new(cluster, table, args.host, args.port, admin_port, events_rx)
        .run()
        .await
    {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "server terminated");
            ExitCode::FAILURE
        }
    }
}
