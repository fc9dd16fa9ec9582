//! HTTP query gateways over the card index and the person graph: full-text
//! card search and people-you-may-know recommendations, both cached.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use cardbox_core::{short_hash, KNOWS_EDGE};
use cardbox_storage::{Cache, GraphStore, SearchIndex, StoreError};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "cardbox-web";

pub const DEFAULT_LIMIT: usize = 10;

#[derive(Clone)]
pub struct AppState {
    pub search: Arc<dyn SearchIndex>,
    pub graph: Arc<dyn GraphStore>,
    pub cache: Arc<dyn Cache>,
    pub config: WebConfig,
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub search_index: String,
    pub cache_ttl: Duration,
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            search_index: "cardbox_bizcard".to_string(),
            cache_ttl: Duration::from_secs(600),
            port: 8000,
        }
    }
}

impl WebConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            search_index: std::env::var("CARDBOX_SEARCH_INDEX").unwrap_or(defaults.search_index),
            cache_ttl: std::env::var("CARDBOX_CACHE_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.cache_ttl),
            port: std::env::var("CARDBOX_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
        }
    }
}

/// Why a gateway request could not be answered. Every variant collapses to
/// the same empty reply at the boundary; the type exists so logs can tell
/// bad input apart from backend failures.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("either query or user must be provided")]
    MissingQuery,
    #[error("user parameter is required")]
    MissingUser,
    #[error("limit must be a number")]
    BadLimit,
    #[error("no person carries that name")]
    UnknownPerson,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Gateway reply: a status code and a raw JSON body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayResponse {
    pub status: StatusCode,
    pub body: String,
}

impl GatewayResponse {
    fn ok(body: String) -> Self {
        Self {
            status: StatusCode::OK,
            body,
        }
    }

    fn empty(status: StatusCode) -> Self {
        Self {
            status,
            body: "[]".to_string(),
        }
    }
}

impl IntoResponse for GatewayResponse {
    fn into_response(self) -> Response {
        (
            self.status,
            [(header::CONTENT_TYPE, "application/json")],
            self.body,
        )
            .into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/search", get(search_handler))
        .route("/pymk", get(pymk_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let port = state.config.port;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "gateway listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Debug, Deserialize, Default)]
struct SearchParams {
    query: Option<String>,
    user: Option<String>,
    limit: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct PymkParams {
    user: Option<String>,
    limit: Option<String>,
}

fn parse_limit(raw: &Option<String>) -> Result<usize, GatewayError> {
    match raw.as_deref() {
        Some(text) => text.parse().map_err(|_| GatewayError::BadLimit),
        None => Ok(DEFAULT_LIMIT),
    }
}

/// Bool query over the card index: a `multi_match` on the free-text fields
/// when `query` is set, and an owner term filter when `user` is set.
pub fn build_search_query(query: &str, user: &str) -> Value {
    let mut body = json!({"query": {"bool": {}}});
    if !query.is_empty() {
        body["query"]["bool"]["must"] = json!({
            "multi_match": {
                "query": query,
                "fields": ["name^3", "company", "job_title", "addr"],
            }
        });
    }
    if !user.is_empty() {
        body["query"]["bool"]["filter"] = json!([{"term": {"owner": user}}]);
    }
    body
}

pub fn search_cache_key(body: &Value, limit: usize) -> String {
    format!(
        "es:query_id:{}:limit:{}",
        short_hash(&body.to_string()),
        limit
    )
}

pub fn pymk_cache_key(user: &str) -> String {
    format!("pymk:query_id:{}", short_hash(&user.to_lowercase()))
}

/// `/search` answers failures with `404` and an empty list body.
async fn search_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> GatewayResponse {
    match run_search(&state, &params).await {
        Ok(body) => GatewayResponse::ok(body),
        Err(err) => {
            warn!(error = %err, "search failed");
            GatewayResponse::empty(StatusCode::NOT_FOUND)
        }
    }
}

async fn run_search(state: &AppState, params: &SearchParams) -> Result<String, GatewayError> {
    let query = params.query.clone().unwrap_or_default();
    let user = params.user.clone().unwrap_or_default();
    let limit = parse_limit(&params.limit)?;

    let body = build_search_query(&query, &user);
    if query.is_empty() && user.is_empty() {
        return Err(GatewayError::MissingQuery);
    }

    let key = search_cache_key(&body, limit);
    if let Some(cached) = state.cache.get(&key).await? {
        return Ok(cached);
    }

    let results = state
        .search
        .search(&state.config.search_index, &body, limit)
        .await?;
    let rendered = serde_json::to_string(&results.hits)?;
    if results.total > 0 {
        state
            .cache
            .set_if_absent(&key, &rendered, state.config.cache_ttl)
            .await?;
    }
    Ok(rendered)
}

/// `/pymk` answers failures with `200` and an empty list body.
async fn pymk_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PymkParams>,
) -> GatewayResponse {
    match run_pymk(&state, &params).await {
        Ok(body) => GatewayResponse::ok(body),
        Err(err) => {
            warn!(error = %err, "pymk failed");
            GatewayResponse::empty(StatusCode::OK)
        }
    }
}

async fn run_pymk(state: &AppState, params: &PymkParams) -> Result<String, GatewayError> {
    let user = params
        .user
        .clone()
        .filter(|user| !user.is_empty())
        .ok_or(GatewayError::MissingUser)?;
    let limit = parse_limit(&params.limit)?;

    let key = pymk_cache_key(&user);
    if let Some(cached) = state.cache.get(&key).await? {
        return Ok(cached);
    }

    let ranked = recommend_people(state.graph.as_ref(), &user, limit).await?;
    let rendered = serde_json::to_string(&ranked)?;
    if !ranked.is_empty() {
        state
            .cache
            .set_if_absent(&key, &rendered, state.config.cache_ttl)
            .await?;
    }
    Ok(rendered)
}

/// Rank friends-of-friends for `user` by how many of the user's direct
/// friends know each candidate. The user and their direct friends are
/// excluded; the limit applies after ranking, and ties break on vertex id
/// so the ordering is stable. Each entry carries the candidate's public
/// properties plus a `score`.
pub async fn recommend_people(
    graph: &dyn GraphStore,
    user: &str,
    limit: usize,
) -> Result<Vec<Value>, GatewayError> {
    let person_id = graph
        .find_person_by_name(&user.to_lowercase())
        .await?
        .ok_or(GatewayError::UnknownPerson)?;

    let friends: HashSet<String> = graph
        .neighbors(&person_id, KNOWS_EDGE)
        .await?
        .into_iter()
        .collect();

    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for friend in &friends {
        for candidate in graph.neighbors(friend, KNOWS_EDGE).await? {
            if candidate == person_id || friends.contains(&candidate) {
                continue;
            }
            *counts.entry(candidate).or_default() += 1;
        }
    }

    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(limit);

    let mut out = Vec::with_capacity(ranked.len());
    for (candidate, score) in ranked {
        let props = graph.vertex_properties(&candidate).await?;
        let mut entry = serde_json::Map::new();
        for (key, value) in props {
            if key == "id" || key.starts_with('_') {
                continue;
            }
            entry.insert(key, Value::String(value));
        }
        entry.insert("score".to_string(), json!(score as f64));
        out.push(Value::Object(entry));
    }
    Ok(out)
}
