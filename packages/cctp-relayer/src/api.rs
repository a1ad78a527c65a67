//! HTTP query API
//!
//! - GET /health - Liveness
//! - GET /metrics - Prometheus metrics
//! - GET /tx/{hash}?domain=N - Messages of a source transaction

use std::net::SocketAddr;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::metrics;
use crate::shutdown::Shutdown;
use crate::state::StateStore;
use crate::types::MessageState;

#[derive(Clone)]
pub struct AppState {
    pub store: StateStore,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Default, Deserialize)]
pub struct TxQuery {
    pub domain: Option<u32>,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn prometheus_metrics() -> Response {
    match metrics::gather_text() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}

async fn tx_state(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    Query(query): Query<TxQuery>,
) -> Result<Json<Vec<MessageState>>, StatusCode> {
    let tx = state.store.get_tx(&hash).ok_or(StatusCode::NOT_FOUND)?;

    let msgs: Vec<MessageState> = tx
        .msgs
        .into_iter()
        .filter(|m| query.domain.map_or(true, |d| m.source_domain == d))
        .collect();

    if msgs.is_empty() {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(msgs))
}

pub fn router(store: StateStore) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .route("/tx/{hash}", get(tx_state))
        .with_state(AppState { store })
}

/// Serve the API until shutdown
pub async fn serve(listen_addr: &str, store: StateStore, shutdown: Shutdown) -> Result<()> {
    let addr: SocketAddr = listen_addr
        .parse()
        .map_err(|e| eyre!("Invalid listen address {}: {}", listen_addr, e))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("API server listening on {}", addr);

    axum::serve(listener, router(store))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("API server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_utils::burn_message_bytes;
    use crate::types::TxState;

    fn store_with_tx() -> StateStore {
        let store = StateStore::new(100, 3600);
        let msgs = vec![
            MessageState::from_message_bytes("0xabc", &burn_message_bytes(0, 4, 1)).unwrap(),
            MessageState::from_message_bytes("0xabc", &burn_message_bytes(6, 4, 2)).unwrap(),
        ];
        store.observe(&TxState::new("0xabc", msgs));
        store
    }

    fn app_state() -> State<AppState> {
        State(AppState {
            store: store_with_tx(),
        })
    }

    #[tokio::test]
    async fn test_health() {
        let Json(body) = health().await;
        assert_eq!(body.status, "ok");
    }

    #[tokio::test]
    async fn test_tx_lookup() {
        let Json(msgs) = tx_state(
            app_state(),
            Path("0xabc".to_string()),
            Query(TxQuery::default()),
        )
        .await
        .unwrap();
        assert_eq!(msgs.len(), 2);
    }

    #[tokio::test]
    async fn test_tx_lookup_domain_filter() {
        let Json(msgs) = tx_state(
            app_state(),
            Path("0xabc".to_string()),
            Query(TxQuery { domain: Some(6) }),
        )
        .await
        .unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].nonce, 2);

        let missing = tx_state(
            app_state(),
            Path("0xabc".to_string()),
            Query(TxQuery { domain: Some(3) }),
        )
        .await;
        assert_eq!(missing.unwrap_err(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_tx_is_404() {
        let result = tx_state(
            app_state(),
            Path("0xdead".to_string()),
            Query(TxQuery::default()),
        )
        .await;
        assert_eq!(result.unwrap_err(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let response = prometheus_metrics().await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_invalid_listen_addr() {
        let result = serve("not an address", StateStore::new(10, 60), Shutdown::new()).await;
        assert!(result.is_err());
    }
}
