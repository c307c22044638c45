use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use ditto_credits::http::{CreditsHttpState, router};
use ditto_credits::telemetry::{TelemetryOptions, init_tracing};
use ditto_credits::{
    AccountStore, AdmissionQueue, CreditGate, CreditLedger, CreditsConfig, HttpGenerationBackend,
    MemoryStore, Observability, StoreConfig, StoreFailurePolicy,
};

#[derive(Parser, Debug)]
#[command(name = "ditto-credits")]
#[command(version, about = "Credit-metered admission control for image generation", long_about = None)]
struct Args {
    /// Config file (.toml, .json, or .yaml with the `config-yaml` feature)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides `server.listen`
    #[arg(long, alias = "addr")]
    listen: Option<String>,

    /// Admin bearer token, overrides `server.admin_token`
    #[arg(long)]
    admin_token: Option<String>,

    /// Read the admin token from this environment variable
    #[arg(long)]
    admin_token_env: Option<String>,

    /// Use a SQLite account store at this path
    #[arg(long, conflicts_with = "redis")]
    sqlite: Option<PathBuf>,

    /// Use a Redis account store at this URL
    #[arg(long)]
    redis: Option<String>,

    #[arg(long, requires = "redis")]
    redis_prefix: Option<String>,

    /// Overrides `max_concurrent`
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Reject generations instead of admitting them when the store is down
    #[arg(long)]
    fail_closed: bool,

    /// Overrides `provider.base_url`
    #[arg(long)]
    provider_url: Option<String>,

    #[arg(long)]
    json_logs: bool,

    /// Export traces over OTLP/HTTP (requires the `otel` feature)
    #[arg(long)]
    otel: bool,

    #[arg(long, requires = "otel")]
    otel_endpoint: Option<String>,
}

impl Args {
    fn apply(self, config: &mut CreditsConfig) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(listen) = self.listen {
            config.server.listen = listen;
        }
        if let Some(token) = self.admin_token {
            config.server.admin_token = Some(token);
        }
        if let Some(env) = self.admin_token_env {
            let token = std::env::var(&env)
                .map_err(|_| format!("admin token env var is not set: {env}"))?;
            config.server.admin_token = Some(token);
        }
        if let Some(path) = self.sqlite {
            config.store = StoreConfig::Sqlite { path };
        }
        if let Some(url) = self.redis {
            config.store = StoreConfig::Redis {
                url,
                prefix: self.redis_prefix,
            };
        }
        if let Some(max_concurrent) = self.max_concurrent {
            config.max_concurrent = max_concurrent;
        }
        if self.fail_closed {
            config.store_failure_policy = StoreFailurePolicy::FailClosed;
        }
        if let Some(url) = self.provider_url {
            config.provider.base_url = url;
        }
        config.validate()?;
        Ok(())
    }
}

async fn build_store(config: &StoreConfig) -> Result<Arc<dyn AccountStore>, Box<dyn std::error::Error>> {
    match config {
        StoreConfig::Memory => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "store-sqlite")]
        StoreConfig::Sqlite { path } => {
            let store = ditto_credits::SqliteStore::new(path);
            store.init().await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "store-sqlite"))]
        StoreConfig::Sqlite { .. } => Err("sqlite store requires the `store-sqlite` feature".into()),
        #[cfg(feature = "store-redis")]
        StoreConfig::Redis { url, prefix } => {
            let mut store = ditto_credits::RedisStore::new(url)?;
            if let Some(prefix) = prefix.as_deref().filter(|prefix| !prefix.trim().is_empty()) {
                store = store.with_prefix(prefix);
            }
            store.ping().await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "store-redis"))]
        StoreConfig::Redis { .. } => Err("redis store requires the `store-redis` feature".into()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let telemetry = TelemetryOptions {
        json_logs: args.json_logs,
        otel: args.otel,
        otel_endpoint: args.otel_endpoint.clone(),
    };
    let _telemetry_guard = init_tracing(&telemetry)?;

    let mut config = match args.config.as_deref() {
        Some(path) => CreditsConfig::load(path)?,
        None => CreditsConfig::default(),
    };
    args.apply(&mut config)?;

    if config.provider.base_url.trim().is_empty() {
        return Err("provider.base_url is not set (use the config file or --provider-url)".into());
    }

    let store = build_store(&config.store).await?;
    let observability = Arc::new(Observability::default());
    let ledger = CreditLedger::new(store)
        .with_top_up_policy(config.top_up_policy())
        .with_exemption(Arc::new(config.exemption()))
        .with_failure_policy(config.store_failure_policy)
        .with_observability(observability);
    let queue = AdmissionQueue::new(config.max_concurrent);
    let gate = CreditGate::new(Arc::new(ledger), Arc::new(queue))
        .with_timeout(config.generation_timeout());

    let mut backend = HttpGenerationBackend::new(config.provider.base_url.clone());
    if let Some(model) = config.provider.model.clone() {
        backend = backend.with_model(model);
    }
    if let Some(api_key) = config.provider.resolve_api_key() {
        backend = backend.with_api_key(api_key);
    }

    let mut state = CreditsHttpState::new(gate, Arc::new(backend));
    if let Some(token) = config.server.admin_token.clone() {
        state = state.with_admin_token(token);
    }

    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    tracing::info!(
        listen = %config.server.listen,
        max_concurrent = config.max_concurrent,
        failure_policy = ?config.store_failure_policy,
        "ditto-credits listening"
    );
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
