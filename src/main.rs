//! finsight server: unified financial data ingestion, querying, and
//! LLM-assisted analysis over a single relational store.

use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use finsight::agent::Agent;
use finsight::config::Config;
use finsight::conversation::ConversationStore;
use finsight::ingestion::IngestionService;
use finsight::insights::InsightsEngine;
use finsight::llm::LlmClient;
use finsight::normalizer::Normalizer;
use finsight::server::{serve, AppState};
use finsight::store::Store;
use finsight::tools::ToolRegistry;

/// Unified financial data service
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Database URL (overrides FINSIGHT_DB_URL)
    #[arg(long, value_name = "URL")]
    db_url: Option<String>,

    /// Host address to bind to
    #[arg(long, value_name = "HOST")]
    host: Option<String>,

    /// Port to bind to
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("finsight={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("finsight starting...");

    // Configuration errors fail fast, before anything binds or connects.
    let mut config = Config::from_env()?;
    if let Some(db_url) = args.db_url {
        config.db_url = db_url;
    }
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    let config = Arc::new(config);

    info!("connecting to store at {}", config.db_url);
    let store = Arc::new(
        Store::connect(
            &config.db_url,
            config.db_pool_size,
            config.db_timeout_s,
            config.source_priority.clone(),
        )
        .await?,
    );

    let normalizer = Normalizer::new(config.source_priority.clone());
    let ingestion = Arc::new(IngestionService::new(
        store.clone(),
        normalizer,
        config.ingest.clone(),
    ));

    let registry = Arc::new(ToolRegistry::new(store.clone()));

    // The service runs without an LLM key; only /query and narrative
    // insights degrade.
    let llm = if config.llm_configured() {
        Some(LlmClient::from_config(&config.llm)?)
    } else {
        warn!("no LLM API key configured; natural-language queries disabled");
        None
    };

    let conversations = Arc::new(ConversationStore::new(
        config.conversation_max_messages,
        config.conversation_ttl_s,
    ));
    let _reaper = conversations.spawn_reaper();

    let agent = llm.clone().map(|client| {
        Arc::new(Agent::new(
            client,
            registry.clone(),
            conversations.clone(),
            config.tool_timeout_s,
        ))
    });

    let insights = Arc::new(InsightsEngine::new(
        registry.clone(),
        llm,
        config.insight_cache_ttl_s,
    ));

    serve(AppState {
        store,
        ingestion,
        agent,
        insights,
        config,
    })
    .await
}
