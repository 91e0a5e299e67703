mod jobs;

use std::sync::Arc;

use {
    clap::Parser,
    tracing::{error, info},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use {
    spherical_auth::TokenStore,
    spherical_config::{ConfigChange, ConfigHandle, NodeConfig},
    spherical_db as db,
    spherical_events::{Broker, EventBus},
    spherical_gateway::GatewayState,
    spherical_hashverifier::{RedisCache, SigningIdentity, VerifierClient},
    spherical_tasks::{PostgresTaskStore, Scheduler, TaskStore},
};

#[derive(Parser)]
#[command(name = "spherical", about = "Spherical: a federated messaging node")]
struct Cli {
    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, default_value_t = false)]
    json_logs: bool,

    /// Address to bind the gateway to.
    #[arg(long, env = "SPHERICAL_BIND", default_value = "0.0.0.0:8000")]
    bind: String,

    /// Postgres connection string.
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Redis connection string (the KV-channel broker).
    #[arg(long, env = "REDIS_URL")]
    redis_url: String,

    /// Public hostname of this node.
    #[arg(long, env = "SPHERICAL_HOSTNAME")]
    hostname: Option<String>,

    /// Speak plain http/ws to other nodes. Only for meshes whose TLS is
    /// terminated in front of every node.
    #[arg(long, env = "SPHERICAL_INSECURE_TRANSPORT", default_value_t = false)]
    insecure_transport: bool,
}

fn init_tracing(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli);

    if let Err(e) = run(cli).await {
        error!(error = %e, "startup failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let pool = db::connect(&cli.database_url).await?;
    let broker = Arc::new(Broker::connect(&cli.redis_url).await?);
    let redis = broker.manager().await?;

    // ── Configuration ───────────────────────────────────────────────────

    let hostname = match &cli.hostname {
        Some(hostname) => hostname.trim().to_lowercase(),
        None => hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_default()
            .to_lowercase(),
    };
    let config = ConfigHandle::new(NodeConfig {
        hostname,
        ..NodeConfig::default()
    });

    // Config edits fan out over the bus; apply them to the live handle.
    let bus = EventBus::new(Arc::clone(&broker));
    bus.start();
    {
        #[derive(serde::Deserialize)]
        struct ConfigEdit {
            key: String,
            value: serde_json::Value,
        }
        let handle = config.clone();
        bus.add_table_watcher("config", move |edit: ConfigEdit| {
            if let Some(change) = ConfigChange::parse(&edit.key, &edit.value) {
                handle.apply(&change);
            }
        })
        .await;
    }

    // ── Signing identity ────────────────────────────────────────────────

    let (_, private_pem) = db::keys::signing_key(&pool, || {
        let identity = SigningIdentity::generate()?;
        Ok((identity.public_pem().to_owned(), identity.private_pem()?))
    })
    .await?;
    let identity = Arc::new(SigningIdentity::from_private_pem(private_pem.as_bytes())?);

    // ── Hash verifier ───────────────────────────────────────────────────

    let snapshot = config.snapshot();
    let mut verifier = VerifierClient::new(
        Some(Arc::new(RedisCache::new(redis.clone()))),
        snapshot.informants.clone(),
        snapshot.trusted_nodes.clone(),
        &snapshot.hostname,
        snapshot.consensus,
    );
    if cli.insecure_transport {
        verifier = verifier.with_plain_http();
    }
    let verifier = Arc::new(verifier);

    // ── Scheduler ───────────────────────────────────────────────────────

    let store: Arc<dyn TaskStore> = Arc::new(PostgresTaskStore::with_pool(pool.clone()));
    let tokens = Arc::new(TokenStore::new(redis, pool.clone()));
    let scheduler = Scheduler::new(Arc::clone(&store), config.clone());
    let registered = jobs::register(&scheduler, &pool, &store, &tokens)?;
    // Prove the dispatch path before going live.
    scheduler
        .run_and_block(&registered.hello, &"startup".to_owned())
        .await?;
    scheduler.start().await;

    // ── Gateway ─────────────────────────────────────────────────────────

    let state = Arc::new(GatewayState {
        config,
        pool,
        tokens,
        verifier,
        identity,
        http: reqwest::Client::new(),
        http_scheme: if cli.insecure_transport { "http" } else { "https" },
        ws_scheme: if cli.insecure_transport { "ws" } else { "wss" },
    });
    let app = spherical_gateway::router(state);

    let listener = tokio::net::TcpListener::bind(&cli.bind).await?;
    info!(bind = %cli.bind, "gateway listening");
    axum::serve(listener, app).await?;

    scheduler.stop().await;
    bus.shutdown();
    Ok(())
}
