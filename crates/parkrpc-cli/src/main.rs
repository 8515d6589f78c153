//! parkrpc CLI entry point.
//!
//! One binary per process role:
//!
//! ```bash
//! # Start the naming service
//! parkrpc directory -b 127.0.0.1:4711
//!
//! # Start the replication coordinator
//! parkrpc coordinator -b 127.0.0.1:4712 -d 127.0.0.1:4711
//!
//! # Start a backend node
//! parkrpc node -b 127.0.0.1:9001 -d 127.0.0.1:4711 -c 127.0.0.1:4712
//!
//! # Run one client operation through the failover layer
//! parkrpc call -d 127.0.0.1:4711 enter-lot 2
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use argh::FromArgs;

use parkrpc_client::{FailoverConfig, FailoverManager, Operation};
use parkrpc_coordinator::{Coordinator, CoordinatorConfig};
use parkrpc_directory::{Directory, DirectoryServer};
use parkrpc_server::{LotNode, LotSpec, LotStore, PerfLog};

/// parkrpc - primary-backup fault-tolerant parking lot service
#[derive(FromArgs)]
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

/// Available process roles.
#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Directory(DirectoryCmd),
    Coordinator(CoordinatorCmd),
    Node(NodeCmd),
    Call(CallCmd),
}

/// Start the naming service
#[derive(FromArgs)]
#[argh(subcommand, name = "directory")]
struct DirectoryCmd {
    /// address to bind to
    #[argh(option, short = 'b', default = "String::from(\"127.0.0.1:4711\")")]
    bind: String,
}

/// Start the replication coordinator
#[derive(FromArgs)]
#[argh(subcommand, name = "coordinator")]
struct CoordinatorCmd {
    /// address to bind the registration endpoint to
    #[argh(option, short = 'b', default = "String::from(\"127.0.0.1:4712\")")]
    bind: String,

    /// directory service address
    #[argh(option, short = 'd')]
    directory: String,

    /// milliseconds between health-probe sweeps
    #[argh(option, default = "1000")]
    detection_interval_ms: u64,

    /// shell command used to restart a dead node ({identity}/{addr} substituted)
    #[argh(option)]
    restart_cmd: Option<String>,
}

/// Start a backend node
#[derive(FromArgs)]
#[argh(subcommand, name = "node")]
struct NodeCmd {
    /// address to bind to
    #[argh(option, short = 'b', default = "String::from(\"127.0.0.1:0\")")]
    bind: String,

    /// directory service address
    #[argh(option, short = 'd')]
    directory: String,

    /// coordinator registration address
    #[argh(option, short = 'c')]
    coordinator: Option<String>,

    /// stable node identity (derived from the bind address when omitted)
    #[argh(option)]
    identity: Option<String>,

    /// number of lots to serve
    #[argh(option, default = "4")]
    lots: u32,

    /// levels per lot
    #[argh(option, default = "3")]
    levels: u32,

    /// capacity per level
    #[argh(option, default = "20")]
    capacity: u32,

    /// file to flush performance timings to
    #[argh(option)]
    perf_log: Option<std::path::PathBuf>,
}

/// Run one client operation through the failover layer
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
struct CallCmd {
    /// directory service address
    #[argh(option, short = 'd')]
    directory: String,

    /// host identity to bind the session under
    #[argh(option, default = "default_host_identity()")]
    host: String,

    /// retry forever instead of giving up when no primary is registered
    #[argh(switch)]
    never_give_up: bool,

    /// operation: enter-lot, exit-lot, move-up, move-down, current-level,
    /// max-level, min-level, lots, other-lots
    #[argh(positional)]
    method: String,

    /// lot number, for operations that take one
    #[argh(positional)]
    lot: Option<u32>,
}

fn default_host_identity() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "client".to_string())
}

/// Derives a stable node identity from the bind address.
fn derive_identity(bind: &str) -> String {
    format!("node-{}", bind.replace([':', '.'], "-"))
}

fn parse_operation(method: &str, lot: Option<u32>) -> Result<Operation> {
    let needs_lot = || lot.ok_or_else(|| anyhow!("'{}' requires a lot number", method));
    Ok(match method {
        "enter-lot" => Operation::EnterLot { lot: needs_lot()? },
        "exit-lot" => Operation::ExitLot,
        "move-up" => Operation::MoveUpLevel,
        "move-down" => Operation::MoveDownLevel,
        "current-level" => Operation::CurrentLevel,
        "max-level" => Operation::MaxLevel,
        "min-level" => Operation::MinLevel,
        "lots" => Operation::Lots,
        "other-lots" => Operation::OtherLotAvailability { lot: needs_lot()? },
        other => return Err(anyhow!("Unknown operation: {}", other)),
    })
}

fn init_logging() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli: Cli = argh::from_env();

    match cli.command {
        Commands::Directory(cmd) => {
            let (addr, handle) = DirectoryServer::new().serve(&cmd.bind).await?;
            println!("Directory running on {}.", addr);
            handle.await?;
        }
        Commands::Coordinator(cmd) => {
            let config = CoordinatorConfig {
                detection_interval: Duration::from_millis(cmd.detection_interval_ms),
                restart_cmd: cmd.restart_cmd,
                ..Default::default()
            };
            let coordinator = Coordinator::new(Directory::new(cmd.directory), config);
            let (addr, serve_handle) = coordinator.serve(&cmd.bind).await?;
            coordinator.bootstrap().await?;
            let probe_loop = coordinator.spawn();
            println!("Coordinator running on {}.", addr);
            let _ = tokio::join!(serve_handle, probe_loop);
        }
        Commands::Node(cmd) => {
            let identity = cmd
                .identity
                .unwrap_or_else(|| derive_identity(&cmd.bind));
            let specs = (1..=cmd.lots)
                .map(|number| LotSpec::uniform(number, cmd.levels, cmd.capacity))
                .collect();
            let node = Arc::new(LotNode::new(
                identity,
                Arc::new(LotStore::new(specs)),
                PerfLog::new(cmd.perf_log),
            ));
            let (addr, handle) = Arc::clone(&node).serve(&cmd.bind).await?;
            let directory = Directory::new(cmd.directory);
            node.register(&directory, cmd.coordinator.as_deref(), &addr.to_string())
                .await?;
            // The restart supervisor watches for this exact line
            println!("Server running.");
            handle.await?;
        }
        Commands::Call(cmd) => {
            let operation = parse_operation(&cmd.method, cmd.lot)?;
            let mut config = FailoverConfig::for_host(cmd.host);
            config.never_give_up = cmd.never_give_up;
            let manager = FailoverManager::connect(&cmd.directory, config).await?;
            let result = manager.call(operation).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            manager.close().await?;
        }
    }
    Ok(())
}
