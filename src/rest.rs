// Copyright 2026 Trellis Contributors
// SPDX-License-Identifier: Apache-2.0

//! HTTP REST API for Trellis.
//!
//! A thin wrapper over [`FetchEngine`]: every endpoint normalizes its
//! parameters into a [`CatalogRequest`] and lets the engine handle
//! caching, request coalescing and strategy fallback. Failures are
//! rendered as the standard error envelope with the mapped status code.

use crate::catalog::{CatalogRequest, Product};
use crate::error::FetchError;
use crate::filter::ProductFilter;
use crate::orchestrator::FetchEngine;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tower_http::cors::{Any, CorsLayer};

/// Build the axum Router with all REST endpoints.
pub fn router(engine: FetchEngine) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/dispensary/*target", get(dispensary))
        .route("/cache/clear", post(clear_cache))
        .layer(cors)
        .with_state(engine)
}

/// Start the REST API server on the given port.
pub async fn start(port: u16, engine: FetchEngine) -> anyhow::Result<()> {
    let app = router(engine);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("REST API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ── Request / response shapes ───────────────────────────────────

/// Query parameters accepted by the catalog endpoints. The filter
/// fields only apply to the `/products` listing.
#[derive(Debug, Deserialize, Default)]
struct CatalogParams {
    max_pages: Option<u32>,
    #[serde(default)]
    force_refresh: bool,
    #[serde(default)]
    include_metadata: bool,
    category: Option<String>,
    min_price: Option<f64>,
    max_price: Option<f64>,
    in_stock: Option<bool>,
}

/// Response document for a catalog fetch.
///
/// `timestamp` is the moment the catalog was fetched from the source,
/// so cache hits report the original fetch time, not the request time.
#[derive(Debug, Serialize)]
struct DispensaryResponse {
    status: &'static str,
    url: String,
    products: Vec<Product>,
    total_products: usize,
    timestamp: DateTime<Utc>,
    cache_hit: bool,
    metadata: HashMap<String, Value>,
}

/// Renders a [`FetchError`] as its JSON envelope with the mapped status.
struct ApiError(FetchError);

impl From<FetchError> for ApiError {
    fn from(err: FetchError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let envelope = self.0.envelope();
        let status =
            StatusCode::from_u16(envelope.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(envelope)).into_response()
    }
}

// ── Handlers ────────────────────────────────────────────────────

async fn health(State(engine): State<FetchEngine>) -> Json<Value> {
    Json(serde_json::json!({
        "status": "success",
        "service": "trellis",
        "version": env!("CARGO_PKG_VERSION"),
        "cache_status": engine.cache().backend_label(),
        "timestamp": Utc::now(),
    }))
}

/// Serves both `/dispensary/{target}` and `/dispensary/{target}/products`.
///
/// The target is itself a URL with slashes, so the route is a single
/// wildcard and the products listing is recognized by its trailing
/// segment rather than by a separate route.
async fn dispensary(
    State(engine): State<FetchEngine>,
    Path(path): Path<String>,
    Query(params): Query<CatalogParams>,
) -> Result<Response, ApiError> {
    if let Some(target) = path.strip_suffix("/products") {
        let products = fetch_filtered(&engine, target, &params).await?;
        return Ok(Json(products).into_response());
    }

    let response = fetch_catalog(&engine, &path, &params).await?;
    Ok(Json(response).into_response())
}

#[derive(Debug, Deserialize, Default)]
struct ClearParams {
    pattern: Option<String>,
}

async fn clear_cache(
    State(engine): State<FetchEngine>,
    Query(params): Query<ClearParams>,
) -> Json<Value> {
    let pattern = params.pattern.unwrap_or_else(|| "*".to_string());
    let cleared = engine.cache().clear(&pattern).await;
    Json(serde_json::json!({
        "status": "success",
        "message": format!("Cache cleared with pattern: {pattern}"),
        "cleared": cleared,
        "timestamp": Utc::now(),
    }))
}

// ── Helpers ─────────────────────────────────────────────────────

async fn fetch_catalog(
    engine: &FetchEngine,
    target: &str,
    params: &CatalogParams,
) -> Result<DispensaryResponse, ApiError> {
    let mut request = CatalogRequest::new(target);
    if let Some(pages) = params.max_pages {
        request.max_pages = pages;
    }
    request.force_refresh = params.force_refresh;
    request.include_metadata = params.include_metadata;

    let outcome = engine.fetch(&request).await?;
    let catalog = outcome.catalog;
    Ok(DispensaryResponse {
        status: "success",
        url: catalog.url.clone(),
        products: catalog.products.clone(),
        total_products: catalog.total_products,
        timestamp: catalog.fetched_at,
        cache_hit: outcome.cache_hit,
        metadata: catalog.metadata.clone(),
    })
}

/// Fetches through the cache like the catalog endpoint, then filters.
async fn fetch_filtered(
    engine: &FetchEngine,
    target: &str,
    params: &CatalogParams,
) -> Result<Vec<Product>, ApiError> {
    let mut request = CatalogRequest::new(target);
    if let Some(pages) = params.max_pages {
        request.max_pages = pages;
    }
    let outcome = engine.fetch(&request).await?;

    let filter = ProductFilter {
        category: params.category.clone(),
        min_price: params.min_price,
        max_price: params.max_price,
        in_stock: params.in_stock,
    };
    Ok(filter.apply(&outcome.catalog.products))
}
