mod config;
use clap::{Parser, Subcommand};
use config::Config;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use warden_core::{
    LockFactory, NodeClaim, NodeIdentityAllocator, ServerInfo, ServiceRegistry,
    SnowflakeGenerator, StoreBuilder,
};

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Node identity, distributed locks and service discovery for service fleets")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Claim a node id, register endpoints and keep them fresh until shutdown
    Start {
        /// Path to configuration file
        #[arg(long = "conf", default_value = "config.yaml")]
        conf: String,
    },
    /// Claim (or recover) this process's node id and print it
    NodeId {
        #[arg(long = "conf", default_value = "config.yaml")]
        conf: String,
    },
    /// List registered endpoints
    Services {
        #[arg(long = "conf", default_value = "config.yaml")]
        conf: String,

        /// Only endpoints of this server type
        #[arg(long)]
        server_type: Option<u32>,

        /// Skip entries older than the expiry window
        #[arg(long, default_value_t = false)]
        live: bool,
    },
    /// Acquire a distributed lock, hold it, then release it
    Lock {
        #[arg(long = "conf", default_value = "config.yaml")]
        conf: String,

        /// Logical lock name
        #[arg(long)]
        key: String,

        #[arg(long, default_value_t = 3)]
        attempts: usize,

        /// Pause between failed attempts
        #[arg(long = "sleep-ms", default_value_t = 100)]
        sleep_ms: u64,

        /// How long to hold the lock before releasing it
        #[arg(long = "hold-ms", default_value_t = 0)]
        hold_ms: u64,
    },
}

fn load_config(path: &str) -> Config {
    match Config::from_file(path) {
        Ok(cfg) => cfg,
        Err(error) => {
            tracing::error!("Failed to load config: {}", error);
            std::process::exit(1);
        }
    }
}

async fn claim_node_id(cfg: &Config, builder: &StoreBuilder) -> NodeClaim {
    let store = match builder.build_identity_store().await {
        Ok(store) => store,
        Err(error) => {
            tracing::error!("Failed to connect identity store: {}", error);
            std::process::exit(1);
        }
    };

    let descriptor = match cfg.descriptor() {
        Ok(descriptor) => descriptor,
        Err(error) => {
            tracing::error!("Failed to describe local process: {}", error);
            std::process::exit(1);
        }
    };

    match NodeIdentityAllocator::new(store).get_node_id(&descriptor).await {
        Ok(claim) => claim,
        Err(error) => {
            tracing::error!("Failed to get node id: {}", error);
            std::process::exit(1);
        }
    }
}

async fn run_start(cfg: Config) {
    let builder = cfg.store_builder();

    let endpoints = match cfg.server_infos() {
        Ok(endpoints) => endpoints,
        Err(error) => {
            tracing::error!("Invalid endpoints: {}", error);
            std::process::exit(2);
        }
    };

    let claim = claim_node_id(&cfg, &builder).await;
    tracing::info!(
        "node id {} ({}) for service {}",
        claim.node_id,
        if claim.recovered { "recovered" } else { "new" },
        cfg.service_key
    );

    match SnowflakeGenerator::new(claim.node_id) {
        Ok(generator) => match generator.generate() {
            Ok(id) => tracing::info!("instance id {}", id),
            Err(error) => tracing::warn!("instance id unavailable: {}", error),
        },
        Err(error) => tracing::warn!("snowflake ids unavailable: {}", error),
    }

    let cache = match builder.build_cache_store().await {
        Ok(cache) => cache,
        Err(error) => {
            tracing::error!("Failed to connect cache store: {}", error);
            std::process::exit(1);
        }
    };

    let (registry, refresh) = match ServiceRegistry::start(cache.registry, cfg.registry_options())
    {
        Ok(started) => started,
        Err(error) => {
            tracing::error!("Failed to start registry: {}", error);
            std::process::exit(1);
        }
    };

    let mut registered: Vec<ServerInfo> = Vec::with_capacity(endpoints.len());
    for endpoint in endpoints {
        match registry.register(endpoint).await {
            Ok(info) => registered.push(info),
            Err(error) => {
                tracing::error!("Failed to register endpoint: {}", error);
                std::process::exit(1);
            }
        }
    }

    shutdown_signal().await;
    tracing::info!("Shutdown signal received...");

    for info in &registered {
        if let Err(error) = registry.deregister(info).await {
            tracing::warn!("Failed to deregister {:?}: {}", info, error);
        }
    }
    refresh.stop().await;

    tracing::info!("Warden stopped");
}

async fn run_services(cfg: Config, server_type: Option<u32>, live: bool) {
    let cache = match cfg.store_builder().build_cache_store().await {
        Ok(cache) => cache,
        Err(error) => {
            tracing::error!("Failed to connect cache store: {}", error);
            std::process::exit(1);
        }
    };

    let registry = ServiceRegistry::new(cache.registry, cfg.registry_options());
    let services = if live {
        registry.live_services(server_type).await
    } else {
        match server_type {
            Some(server_type) => registry.get_service(server_type).await,
            None => registry.list_services().await,
        }
    };

    match services {
        Ok(services) => {
            for info in services {
                match info.encode() {
                    Ok(field) => println!("{}", field),
                    Err(error) => tracing::debug!("skipping {:?}: {}", info, error),
                }
            }
        }
        Err(error) => {
            tracing::error!("Failed to list services: {}", error);
            std::process::exit(1);
        }
    }
}

async fn run_lock(cfg: Config, key: String, attempts: usize, sleep_ms: u64, hold_ms: u64) {
    let cache = match cfg.store_builder().build_cache_store().await {
        Ok(cache) => cache,
        Err(error) => {
            tracing::error!("Failed to connect cache store: {}", error);
            std::process::exit(1);
        }
    };

    let mutex = LockFactory::new(cache.locks, cfg.lock_keyspace()).new_mutex(&key);
    if !mutex
        .try_lock(attempts, Duration::from_millis(sleep_ms))
        .await
    {
        tracing::error!("lock {} not acquired after {} attempts", mutex.key(), attempts);
        std::process::exit(3);
    }

    tracing::info!("acquired lock {} with token {}", mutex.key(), mutex.token());
    tokio::time::sleep(Duration::from_millis(hold_ms)).await;

    if mutex.unlock().await {
        tracing::info!("released lock {}", mutex.key());
    } else {
        tracing::warn!("lock {} expired before release", mutex.key());
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            (Err(error), _) | (_, Err(error)) => {
                tracing::warn!("Failed to install signal handlers: {}", error);
            }
        }
    }

    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to wait for ctrl-c: {}", error);
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warden=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { conf } => {
            tracing::info!("Starting Warden with config: {}", conf);
            run_start(load_config(&conf)).await;
        }
        Commands::NodeId { conf } => {
            let cfg = load_config(&conf);
            let claim = claim_node_id(&cfg, &cfg.store_builder()).await;
            println!("{}", claim.node_id);
        }
        Commands::Services {
            conf,
            server_type,
            live,
        } => {
            run_services(load_config(&conf), server_type, live).await;
        }
        Commands::Lock {
            conf,
            key,
            attempts,
            sleep_ms,
            hold_ms,
        } => {
            run_lock(load_config(&conf), key, attempts, sleep_ms, hold_ms).await;
        }
    }
}
