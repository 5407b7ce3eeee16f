use anyhow::Context;
use clap::Parser;
use hostlink_core::frame::CURRENT_PROTOCOL_VERSION;
use hostlink_ipc::{Broadcaster, CallGateway, Registry, SocketHost, SocketHostConfig, SubscriptionBroker};
use hostlink_store::{KvStore, StoreConfig, StoreService};
use serde_json::json;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const SOCKET_FILE_NAME: &str = "hostlink.sock";
const LIFECYCLE_CHANNEL: &str = "host:lifecycle";

#[derive(Clone, Debug)]
struct Config {
    socket_path: PathBuf,
    data_dir: PathBuf,
    debug: bool,
    write_timeout: Duration,
    queue_capacity: usize,
}

#[derive(Parser, Debug)]
#[command(name = "hostlink-host")]
struct Args {
    #[arg(long, default_value = "")]
    socket: String,
    #[arg(long, default_value = "")]
    data_dir: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value_t = 1000)]
    write_timeout_ms: u64,
    #[arg(long, default_value_t = hostlink_ipc::socket::DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    init_logging(&config);
    if let Err(err) = run(config).await {
        error!(event = "host_error", error = %format!("{err:#}"));
        std::process::exit(1);
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;

    let registry = Registry::new();
    let mut socket_config = SocketHostConfig::new(&config.socket_path);
    socket_config.write_timeout = config.write_timeout;
    socket_config.queue_capacity = config.queue_capacity;
    let host = SocketHost::new(socket_config);

    let gateway = CallGateway::new(host.clone());
    let broker = SubscriptionBroker::new(host.clone(), Arc::clone(&registry));
    let broadcaster = Broadcaster::new(host.clone());
    let lifecycle = broadcaster.register(LIFECYCLE_CHANNEL);

    let stores = vec![
        KvStore::open(StoreConfig::preferences(&config.data_dir)).await,
        KvStore::open(StoreConfig::cache(&config.data_dir)).await,
        KvStore::open(StoreConfig::temp(&config.data_dir)).await,
    ];
    for store in &stores {
        StoreService::register(store, &gateway, &broker);
    }
    register_info(&gateway, &registry, &stores);

    let serve = tokio::spawn(Arc::clone(&host).serve(registry.shutdown_signal()));
    info!(
        event = "host_start",
        socket = %config.socket_path.display(),
        data_dir = %config.data_dir.display(),
        stores = stores.len()
    );
    lifecycle.emit(json!({"state": "ready"}));

    let _ = tokio::signal::ctrl_c().await;
    info!(event = "host_stopping", active_subscriptions = registry.active_count());
    lifecycle.emit(json!({"state": "stopping"}));
    registry.shutdown();

    match serve.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(event = "host_serve_error", error = %err),
        Err(err) => warn!(event = "host_serve_join_error", error = %err),
    }

    for store in &stores {
        if let Err(err) = store.close() {
            warn!(event = "store_close_failed", prefix = %store.prefix(), error = %err);
        }
    }
    info!(event = "host_stop");
    Ok(())
}

fn register_info(gateway: &CallGateway, registry: &Arc<Registry>, stores: &[Arc<KvStore>]) {
    let registry = Arc::clone(registry);
    let prefixes = stores
        .iter()
        .map(|store| store.prefix().to_string())
        .collect::<Vec<_>>();
    gateway.register("host:info", move |_input| {
        let registry = Arc::clone(&registry);
        let prefixes = prefixes.clone();
        async move {
            Ok::<_, anyhow::Error>(json!({
                "protocol_version": CURRENT_PROTOCOL_VERSION,
                "pid": std::process::id(),
                "stores": prefixes,
                "active_subscriptions": registry.active_count(),
            }))
        }
    });
}

fn load_config() -> Config {
    let args = Args::parse();
    let data_dir = resolve_data_dir(&args.data_dir);
    let socket_path = resolve_socket(&args.socket, &data_dir);
    let debug = args.debug || env_true("HOSTLINK_DEBUG");
    Config {
        socket_path,
        data_dir,
        debug,
        write_timeout: Duration::from_millis(args.write_timeout_ms.max(1)),
        queue_capacity: args.queue_capacity.max(1),
    }
}

fn init_logging(config: &Config) {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("HOSTLINK_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("logging already initialized");
    }
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn resolve_data_dir(flag: &str) -> PathBuf {
    if !flag.trim().is_empty() {
        return PathBuf::from(flag);
    }
    if let Some(value) = env_non_empty("HOSTLINK_DATA_DIR") {
        return PathBuf::from(value);
    }
    default_data_dir()
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("hostlink"))
        .unwrap_or_else(|| PathBuf::from(".hostlink"))
}

fn resolve_socket(flag: &str, data_dir: &std::path::Path) -> PathBuf {
    if !flag.trim().is_empty() {
        return PathBuf::from(flag);
    }
    if let Some(value) = env_non_empty("HOSTLINK_SOCKET") {
        return PathBuf::from(value);
    }
    data_dir.join(SOCKET_FILE_NAME)
}
