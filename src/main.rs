use std::sync::Arc;

use anyhow::Context;

use reflect_flow::config::EngineConfig;
use reflect_flow::deepthink::spawn_deepthink_sweeper;
use reflect_flow::flow::{FlowEngine, flow_routes};
use reflect_flow::governance::GovernanceConfig;
use reflect_flow::llm::create_provider;
use reflect_flow::store::LibSqlBackend;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = EngineConfig::from_env().context("invalid configuration")?;

    // Without a key every generated turn uses the canned fallback.
    let llm = match config.llm_config() {
        Some(llm_config) => Some(create_provider(&llm_config).context("failed to create LLM provider")?),
        None => {
            tracing::warn!(provider = ?config.provider, "No API key set, generator disabled");
            None
        }
    };

    // ── Database ─────────────────────────────────────────────────────────
    let db = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );

    // ── Governance ───────────────────────────────────────────────────────
    let governance = match &config.governance_path {
        Some(path) => GovernanceConfig::load(path)
            .with_context(|| format!("failed to load governance from {}", path.display()))?,
        None => GovernanceConfig::builtin(),
    };

    let engine = Arc::new(FlowEngine::from_database(
        db,
        llm,
        Arc::new(governance),
        &config,
    ));

    // ── Deep Think sweeper ──────────────────────────────────────────────
    let _sweeper = spawn_deepthink_sweeper(Arc::clone(&engine), config.deepthink_sweep_interval);

    eprintln!("Reflect Flow v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {} ({:?})", config.model, config.provider);
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Turn API: http://0.0.0.0:{}/api/flow/turn", config.port);
    eprintln!(
        "   Retrieval: {}",
        if config.retrieval_enabled { "enabled" } else { "disabled" }
    );

    let app = flow_routes(engine);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    tracing::info!(port = config.port, "Flow server started");
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
