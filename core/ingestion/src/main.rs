use anyhow::Result;
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use clap::Parser;
use memory_graph_indexing::{
    qdrant::DEFAULT_COLLECTION, BusEmbeddingBackend, EmbeddingConfig, EmbeddingProvider,
    EmbeddingResponder, InMemoryVectorStore, InProcessBus, MessageBus, ModelServerClient,
    QdrantVectorStore, VectorStore,
};
use memory_graph_ingestion::{
    DetectorConfig, EventPublisher, HeuristicAnalyzer, MemoryProcessor, ProcessingWorker,
    ProcessorConfig, SqliteRelationshipStore,
};
use memory_graph_schemas::{subjects, Memory, MemoryEvent};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "memory-graph")]
#[command(about = "Analyzes incoming memories and links related ones")]
struct Cli {
    /// Embedding model server base URL
    #[arg(long, env = "MODEL_SERVER_URL", default_value = "http://127.0.0.1:8080")]
    model_server_url: String,

    /// Model identifier sent with every embedding request
    #[arg(long, env = "EMBEDDING_MODEL", default_value = "all-MiniLM-L6-v2")]
    embedding_model: String,

    /// Expected embedding dimension; learned from the first reply when unset
    #[arg(long, env = "EMBEDDING_DIMENSION")]
    embedding_dimension: Option<usize>,

    /// Texts per embedding sub-batch
    #[arg(long, env = "EMBEDDING_BATCH_SIZE", default_value_t = 16)]
    embedding_batch_size: usize,

    /// Sub-batches in flight at once (capped at 10)
    #[arg(long, env = "EMBEDDING_CONCURRENCY", default_value_t = 3)]
    embedding_concurrency: usize,

    /// Per-request embedding timeout in seconds
    #[arg(long, env = "EMBEDDING_TIMEOUT_SECS", default_value_t = 30)]
    embedding_timeout_secs: u64,

    /// Qdrant gRPC URL (e.g. http://localhost:6334); vectors stay in memory when unset
    #[arg(long, env = "QDRANT_URL")]
    qdrant_url: Option<String>,

    #[arg(long, env = "QDRANT_COLLECTION", default_value = DEFAULT_COLLECTION)]
    qdrant_collection: String,

    /// SQLite database for relationships
    #[arg(long, env = "DB_PATH", default_value = "memory-graph.db")]
    db_path: PathBuf,

    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:21954")]
    bind_addr: String,
}

#[derive(Clone)]
struct AppState {
    bus: Arc<InProcessBus>,
    processor: Arc<MemoryProcessor>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Memory Graph Service v0.1.0");

    let cli = Cli::parse();

    // Message bus and embedding responder
    let bus = Arc::new(InProcessBus::new());
    let model_client = Arc::new(
        ModelServerClient::new(&cli.model_server_url, &cli.embedding_model)
            .with_timeout(Duration::from_secs(cli.embedding_timeout_secs)),
    );
    let responder = EmbeddingResponder::new(
        model_client,
        bus.subscribe(subjects::EMBEDDING_REQUEST),
    );
    tokio::spawn(responder.run());
    info!(
        "Embedding responder using {} ({})",
        cli.model_server_url, cli.embedding_model
    );

    let backend = BusEmbeddingBackend::new(Some(bus.clone() as Arc<dyn MessageBus>))
        .with_timeout(Duration::from_secs(cli.embedding_timeout_secs));
    let embeddings = Arc::new(EmbeddingProvider::new(
        Arc::new(backend),
        EmbeddingConfig {
            batch_size: cli.embedding_batch_size,
            max_concurrent_batches: cli.embedding_concurrency,
            expected_dimension: cli.embedding_dimension,
            ..Default::default()
        },
    ));

    // Vector store
    let vector_store: Arc<dyn VectorStore> = match &cli.qdrant_url {
        Some(url) => {
            let store = QdrantVectorStore::new(url, &cli.qdrant_collection)?;
            // Otherwise the collection is created by the first write
            if let Some(dimension) = cli.embedding_dimension {
                store.ensure_collection(dimension).await?;
            }
            info!("Using Qdrant at {} (collection {})", url, cli.qdrant_collection);
            Arc::new(store)
        }
        None => {
            info!("QDRANT_URL not set, keeping vectors in memory");
            Arc::new(InMemoryVectorStore::new())
        }
    };

    // Relationship persistence
    if let Some(parent) = cli.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let relationship_store = Arc::new(SqliteRelationshipStore::new(&cli.db_path)?);
    info!("Relationship store at: {}", cli.db_path.display());

    let processor = Arc::new(
        MemoryProcessor::new(
            Arc::new(HeuristicAnalyzer::new()),
            embeddings,
            vector_store,
            DetectorConfig::default(),
            ProcessorConfig::default(),
        )
        .with_relationship_store(relationship_store)
        .with_publisher(EventPublisher::new(bus.clone())),
    );

    let worker = ProcessingWorker::new(processor.clone(), bus.subscribe(subjects::MEMORY_CREATED));
    tokio::spawn(worker.run());

    let state = AppState { bus, processor };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(get_stats))
        .route("/stats/reset", post(reset_stats))
        .route("/ingest/memory", post(ingest_memory))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("Starting HTTP server on {}", cli.bind_addr);
    let listener = tokio::net::TcpListener::bind(&cli.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let embeddings = state.processor.embeddings();
    let embedding_ok = embeddings.health_check().await;

    Json(serde_json::json!({
        "service": "memory-graph",
        "status": if embedding_ok { "healthy" } else { "degraded" },
        "version": "0.1.0",
        "embedding": {
            "healthy": embedding_ok,
            "dimension": embeddings.dimension(),
            "memory": embeddings.memory_usage(),
            "cache": embeddings.cache_stats(),
        }
    }))
}

async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.processor.stats())
}

async fn reset_stats(State(state): State<AppState>) -> impl IntoResponse {
    state.processor.reset_stats();
    info!("Processing stats reset");
    StatusCode::NO_CONTENT
}

async fn ingest_memory(
    State(state): State<AppState>,
    Json(memory): Json<Memory>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    info!("Ingesting memory: {}", memory.id);
    let memory_id = memory.id.clone();

    let payload = serde_json::to_vec(&MemoryEvent::new(memory)).map_err(|e| {
        error!("Failed to encode memory event: {}", e);
        (StatusCode::BAD_REQUEST, e.to_string())
    })?;

    state
        .bus
        .publish(subjects::MEMORY_CREATED, payload)
        .await
        .map_err(|e| {
            error!("Failed to queue memory {}: {}", memory_id, e);
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "memory_id": memory_id.0,
            "status": "queued"
        })),
    ))
}
