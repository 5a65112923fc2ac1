//! jstree-data - serves adjacency-list entities as jsTree JSON.

mod cache;
mod config;
mod error;
mod picker;
mod rows;
mod tree;

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use cache::{MemoryCache, TreeCache};
use config::{ConfigStore, ServerSettings};
use picker::{PickerConfig, PickerQuery};
use rows::{MemoryRowSource, RowSource};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tree::{Selection, TreeFlattener, TreeItem};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    configs: Arc<ConfigStore>,
    trees: Arc<HashMap<String, Arc<TreeFlattener>>>,
    cache: Arc<dyn TreeCache>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "jstree_data=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = ServerSettings::from_env();

    let source: Arc<dyn RowSource> =
        Arc::new(MemoryRowSource::load_from_file(&settings.data_file)?);
    let cache: Arc<dyn TreeCache> = Arc::new(MemoryCache::new());

    let configs = ConfigStore::load_from_dir(&settings.config_dir)?;
    info!("Loaded {} tree actions: {:?}", configs.list().len(), configs.list());

    // Every action is validated here; a bad one stops startup.
    let trees = build_trees(&configs, source, cache.clone())?;

    let app = router(AppState {
        configs: Arc::new(configs),
        trees: Arc::new(trees),
        cache,
    });

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    info!("Server listening on http://{}", settings.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_trees(
    configs: &ConfigStore,
    source: Arc<dyn RowSource>,
    cache: Arc<dyn TreeCache>,
) -> anyhow::Result<HashMap<String, Arc<TreeFlattener>>> {
    let mut trees = HashMap::new();
    for config in configs.all() {
        let name = config.name.clone();
        let tree = TreeFlattener::new(config, source.clone(), cache.clone())
            .with_context(|| format!("Invalid tree action: {}", name))?;
        info!("Tree action '{}' serves entity '{}'", name, tree.entity());
        trees.insert(name, Arc::new(tree));
    }
    Ok(trees)
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/trees", get(list_trees))
        .route("/trees/:name", get(get_tree))
        .route("/trees/:name/picker", get(get_picker))
        .route("/cache/invalidate/:entity", post(invalidate_entity))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint.
async fn health() -> &'static str {
    "ok"
}

/// List configured tree actions.
async fn list_trees(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.configs.list())
}

/// Tree data for jsTree, with selection taken from the query string.
async fn get_tree(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Vec<TreeItem>>, (StatusCode, String)> {
    let tree = state
        .trees
        .get(&name)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Unknown tree action: {}", name)))?;

    let selection = Selection::from_query(&query, tree.config());
    let items = tree.build(&selection).await.map_err(|e| {
        error!("Tree '{}' failed: {}", name, e);
        (StatusCode::BAD_GATEWAY, e.to_string())
    })?;

    Ok(Json(items))
}

/// Picker configuration for a form input bound to a tree action.
async fn get_picker(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<PickerQuery>,
) -> Result<Json<PickerConfig>, StatusCode> {
    state
        .configs
        .get(&name)
        .map(|config| Json(picker::picker_config(config, &query)))
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, serde::Serialize)]
struct InvalidateResponse {
    entity: String,
    tag: String,
    evicted: usize,
}

/// Drop every cached tree built from `entity`.
async fn invalidate_entity(
    State(state): State<AppState>,
    Path(entity): Path<String>,
) -> Json<InvalidateResponse> {
    let tag = TreeFlattener::cache_tag(&entity);
    let evicted = state.cache.invalidate_tag(&tag);
    info!("Invalidated {} cached trees for '{}'", evicted, entity);
    Json(InvalidateResponse {
        entity,
        tag,
        evicted,
    })
}
