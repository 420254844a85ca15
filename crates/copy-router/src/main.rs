//! Copy routing daemon entrypoint.

use clap::{Parser, Subcommand};
use copy_core::config::Config;
use copy_core::notifier::Notifier;
use copy_core::pool::PoolClient;
use copy_core::store::RedisStore;
use copy_router::control::ControlBus;
use copy_router::{AdvancedRouter, RoutingConfig};
use copy_engine::WorkerConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Multi-route filtered copy routing engine
#[derive(Parser)]
#[command(name = "copy-router")]
#[command(about = "Mirrors positions between brokerage accounts per configured routes")]
#[command(version)]
struct Cli {
    /// Routing config path (overrides ROUTING_CONFIG_PATH)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the router (default)
    Run,

    /// Validate the routing config and exit
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "copy_router=info,copy_engine=info,copy_core=info,position_monitor=info,risk_monitor=info,hyper=warn,tungstenite=warn".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let env_config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Environment configuration invalid");
            std::process::exit(1);
        }
    };

    let config_path = cli
        .config
        .unwrap_or_else(|| PathBuf::from(&env_config.routing_config_path));

    let routing_config = match RoutingConfig::load_or_bootstrap(&config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Routing config unloadable");
            std::process::exit(1);
        }
    };

    if let Err(e) = routing_config.validate() {
        tracing::error!(error = %e, "Routing config invalid");
        std::process::exit(1);
    }

    if matches!(cli.command, Some(Commands::Validate)) {
        tracing::info!(path = %config_path.display(), "Routing config is valid");
        return Ok(());
    }

    let pool = Arc::new(PoolClient::new(
        &env_config.pool.base_url,
        Duration::from_secs(env_config.pool.request_timeout_secs),
    )?);

    let store = match RedisStore::connect(&env_config.redis.url).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!(error = %e, "State store unreachable");
            std::process::exit(1);
        }
    };

    let notifier = Arc::new(Notifier::from_config(&env_config.alerts));

    let router = AdvancedRouter::new(
        routing_config,
        config_path,
        copy_router::RouterDeps {
            pool,
            store: store.clone(),
            notifier,
        },
        WorkerConfig::default(),
    );

    if let Err(e) = router.start().await {
        tracing::error!(error = %e, "Router failed to start");
        std::process::exit(1);
    }

    let control = ControlBus::new(env_config.redis.url.clone(), router.clone(), store);
    tokio::spawn(async move {
        control.run().await;
    });

    tracing::info!("Router running; Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    router.stop().await;
    Ok(())
}
