use std::env;
use std::panic;
use std::sync::Arc;

use anyhow::{Context, Result};
use cascade::object::Object;
use cascade::pool::ShardingPolicy;
use clap::{Parser, Subcommand};
use log::info;

use cascade_node::config::NodeConfig;
use cascade_node::node::Node;
use cascade_node::trace;

#[derive(Debug, Parser)]
#[command(version, author, about = "Cascade node: a minimal operational surface over the cascade library")]
struct Args {
    /// Configuration file path.
    #[clap(short = 'c', long = "config", default_value = "config/cascade-node.yaml")]
    config: String,

    #[clap(short = 'l', long, default_value = "info")]
    log_level: Option<String>,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Creates an object pool with `shard_count` hash-sharded shards.
    CreatePool {
        pathname: String,
        #[clap(long, default_value = "1")]
        shard_count: usize,
    },
    /// Commits a value and prints the assigned `(version, timestamp_us)`.
    Put { pathname: String, key: String, value: String },
    /// Reads the current value for a key and prints it to stdout.
    Get { pathname: String, key: String },
    /// Commits a tombstone for a key.
    Remove { pathname: String, key: String },
    /// Starts the node and blocks until Ctrl-C, for long-running smoke tests.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_hooks();

    let args = Args::parse();

    let log_dir = format!("{}/.cascade-node", env::var("HOME").unwrap_or_else(|_| ".".to_string()));
    let _guards = trace::init_logging(&log_dir, args.log_level.as_deref().unwrap_or("info")).await?;

    let config: NodeConfig = confy::load_path(&args.config).unwrap_or_else(|err| {
        log::warn!("failed to load config at {}: {}; using defaults", args.config, err);
        NodeConfig::default()
    });
    info!("cascade-node starting with data_dir={:?}", config.data_dir());

    let node = Node::open(config.data_dir(), config.evaluation_mode(), config.ocdpo_pool_size())
        .context("failed to open node state")?;

    let running = Arc::new(std::sync::atomic::AtomicBool::new(true));
    let shutdown_node = node.clone();
    let running_for_handler = running.clone();
    ctrlc::set_handler(move || {
        println!("received Ctrl+C, shutting down");
        running_for_handler.store(false, std::sync::atomic::Ordering::SeqCst);
    })
    .context("failed to install Ctrl-C handler")?;

    match args.cmd {
        Command::CreatePool { pathname, shard_count } => {
            let (version, ts) =
                node.create_pool(&pathname, shard_count, ShardingPolicy::Hash).await?;
            println!("created pool {} (version={}, timestamp_us={})", pathname, version, ts);
        }
        Command::Put { pathname, key, value } => {
            let store = node.shard_for_key(&pathname, &key).await?;
            let (version, ts) = store.put(Object::new(key.clone(), value.into_bytes())).await?;
            println!("put {}/{} (version={}, timestamp_us={})", pathname, key, version, ts);
        }
        Command::Get { pathname, key } => {
            let store = node.shard_for_key(&pathname, &key).await?;
            let object = store.get(&key, None, false).await?;
            if object.is_invalid() {
                println!("{}/{}: <no value>", pathname, key);
            } else {
                println!("{}/{}: {}", pathname, key, String::from_utf8_lossy(&object.blob));
            }
        }
        Command::Remove { pathname, key } => {
            let store = node.shard_for_key(&pathname, &key).await?;
            let (version, ts) = store.remove(key.clone()).await?;
            println!("removed {}/{} (version={}, timestamp_us={})", pathname, key, version, ts);
        }
        Command::Serve => {
            println!("cascade-node serving; press Ctrl-C to stop");
            while running.load(std::sync::atomic::Ordering::SeqCst) {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }

    shutdown_node.shutdown().await;
    Ok(())
}

fn setup_panic_hooks() {
    let meta = human_panic::Metadata {
        version: env!("CARGO_PKG_VERSION").into(),
        name: env!("CARGO_PKG_NAME").into(),
        authors: env!("CARGO_PKG_AUTHORS").replace(':', ", ").into(),
        homepage: env!("CARGO_PKG_HOMEPAGE").into(),
    };

    let default_hook = panic::take_hook();
    if env::var("RUST_BACKTRACE").is_err() {
        panic::set_hook(Box::new(move |info: &panic::PanicInfo| {
            default_hook(info);
            let file_path = human_panic::handle_dump(&meta, info);
            human_panic::print_msg(file_path, &meta)
                .expect("human-panic: printing error message to console failed");
        }));
    }
}
