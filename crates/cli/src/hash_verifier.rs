//! Standalone hash-verification node: just `/verify` over a pluggable cache
//! backend. Useful as a neutral witness that keeps no other state.

use std::sync::Arc;

use {
    axum::{
        Router,
        extract::State,
        http::{HeaderMap, StatusCode, header},
        response::{IntoResponse, Response},
        routing::post,
    },
    clap::Parser,
    tracing::{error, info},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use spherical_hashverifier::{
    HashCache, RedisCache, SqliteCache, VerifierClient, client::parse_skip_header,
};

#[derive(Parser)]
#[command(name = "hash-verifier", about = "Spherical standalone hash verification node")]
struct Cli {
    /// Address the verifier listens on.
    #[arg(long, default_value = "0.0.0.0:8080")]
    host: String,

    /// Redis connection string. Overrides the file cache when set.
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Embedded cache database path, used when no redis URL is given.
    #[arg(long, default_value = "./hash-verifier.db")]
    cache_path: String,

    /// Trusted confirmations needed to clear an unverifiable hash. Zero
    /// disables the consensus fallback.
    #[arg(long, default_value_t = 3)]
    consensus: u32,

    /// Additional nodes to inform of new hashes (repeatable). Trusted nodes
    /// are informed regardless.
    #[arg(long)]
    informants: Vec<String>,

    /// Nodes trusted enough that `consensus` of them can vouch for a blob
    /// (repeatable).
    #[arg(long = "trusted-nodes")]
    trusted_nodes: Vec<String>,

    /// Our own hostname: stripped from the host lists and sent in `X-Skip`.
    #[arg(long, default_value = "")]
    hostname: String,

    /// Speak plain http to other verifiers (TLS-terminated meshes only).
    #[arg(long, default_value_t = false)]
    insecure_transport: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn normalize(hosts: Vec<String>, own_hostname: &str) -> Vec<String> {
    hosts
        .into_iter()
        .map(|h| h.trim().to_lowercase())
        .filter(|h| !h.is_empty() && h != own_hostname)
        .collect()
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    if let Err(e) = run(cli).await {
        error!(error = %e, "startup failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let hostname = cli.hostname.trim().to_lowercase();
    let informants = normalize(cli.informants, &hostname);
    let trusted = normalize(cli.trusted_nodes, &hostname);

    if cli.consensus as usize > trusted.len() {
        anyhow::bail!("consensus count greater than trusted node count");
    }

    let cache: Arc<dyn HashCache> = match &cli.redis_url {
        Some(url) => {
            let client = redis::Client::open(url.as_str())?;
            let manager = client.get_connection_manager().await?;
            Arc::new(RedisCache::new(manager))
        },
        None => {
            let url = format!("sqlite://{}?mode=rwc", cli.cache_path);
            Arc::new(SqliteCache::new(&url).await?)
        },
    };

    let mut verifier = VerifierClient::new(Some(cache), informants, trusted, &hostname, cli.consensus);
    if cli.insecure_transport {
        verifier = verifier.with_plain_http();
    }

    let app = Router::new()
        .route("/verify", post(verify))
        .with_state(Arc::new(verifier));

    let listener = tokio::net::TcpListener::bind(&cli.host).await?;
    info!(host = %cli.host, "hash verifier listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn verify(
    State(verifier): State<Arc<VerifierClient>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if body.is_empty() {
        return (StatusCode::BAD_REQUEST, "Not found.").into_response();
    }
    let skip = parse_skip_header(headers.get("X-Skip").and_then(|v| v.to_str().ok()));
    let accepted = verifier.process_hash_blob(&body, &skip).await;
    let body = if accepted { "true" } else { "false" };
    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
}
