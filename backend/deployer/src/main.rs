//! Deployer — entry point.
//!
//! Discovers contracts, restores persisted deployment and funding state, and
//! runs the orchestrator.  A small Axum REST API exposes contract status, the
//! event feed, funding progress, and contribution intake while it runs.

use std::sync::Arc;

use reqwest::Client;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use deployer::api::{self, ApiState};
use deployer::chain::HiroClient;
use deployer::compiler::CommandCompiler;
use deployer::config::Config;
use deployer::db;
use deployer::orchestrator::{Collaborators, Orchestrator, OrchestratorSettings};
use deployer::registry::{CategoryRules, Registry};
use deployer::signer::CommandSigner;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;
    info!(
        "Deploying to {} via {} as {}",
        config.network.as_str(),
        config.api_url,
        config.deployer_address
    );

    let registry = Registry::discover(
        Some(config.contracts_manifest.as_path()),
        Some(config.contracts_dir.as_path()),
        &CategoryRules::default(),
    )?;

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url).await?;

    let client = Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()?;

    let collaborators = Collaborators {
        chain: Arc::new(HiroClient::new(
            client,
            config.api_url.clone(),
            config.api_key.clone(),
        )),
        signer: Arc::new(CommandSigner::new(config.signer_command.clone())?),
        compiler: Arc::new(CommandCompiler::new(config.compiler_command.clone())),
    };

    let orchestrator = Arc::new(
        Orchestrator::load(
            registry,
            collaborators,
            pool,
            OrchestratorSettings::from_config(&config),
        )
        .await?,
    );

    if config.dry_run {
        let report = orchestrator.run().await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let cancel = orchestrator.cancel_token();

    // ─── Operator abort ───────────────────────────────────
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received; finishing in-flight work without new submissions");
                cancel.cancel();
            }
        });
    }

    // ─── REST API ─────────────────────────────────────────
    let app = api::router(Arc::new(ApiState {
        orchestrator: Arc::clone(&orchestrator),
    }));
    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let server = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await
        })
    };

    // ─── Deployment run ───────────────────────────────────
    let result = orchestrator.run().await;
    cancel.cancel();
    if let Err(e) = server.await? {
        error!("API server error: {e}");
    }

    let report = result?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
