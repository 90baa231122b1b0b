use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::warn;

use crate::WebhookState;

const ADMIN_DEACTIVATE_EVENT_NAME: &str = "admin_deactivate";
const RECENT_SUBSCRIPTIONS_LIMIT: i64 = 50;

pub fn router() -> Router<Arc<WebhookState>> {
    Router::new()
        .route("/admin/subscriptions", get(list_recent))
        .route("/admin/subscriptions/{id}/deactivate", post(deactivate))
}

async fn list_recent(State(state): State<Arc<WebhookState>>) -> Response {
    match state.store.list_recent_subscriptions(RECENT_SUBSCRIPTIONS_LIMIT).await {
        Ok(subs) => Json(subs).into_response(),
        Err(e) => {
            warn!(error = %e, "failed to list recent subscriptions");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"status": "error"}))).into_response()
        }
    }
}

async fn deactivate(State(state): State<Arc<WebhookState>>, Path(subscription_id): Path<i64>) -> Response {
    let event_name = format!("{ADMIN_DEACTIVATE_EVENT_NAME}_{subscription_id}");
    let deactivated = match state
        .store
        .deactivate_subscription_by_id(subscription_id, &event_name)
        .await
    {
        Ok(d) => d,
        Err(e) => {
            warn!(error = %e, subscription_id, "admin deactivate failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"status": "error"}))).into_response();
        }
    };

    let Some(sub) = deactivated else {
        return (StatusCode::NOT_FOUND, Json(json!({"status": "error", "error": "not found or already inactive"})))
            .into_response();
    };

    if let Err(e) = state.gateway.remove_peer(&sub.client_public_key).await {
        warn!(error = %e, subscription_id, "failed to remove gateway peer on admin deactivation");
    }

    (StatusCode::OK, Json(json!({"status": "ok", "subscription_id": sub.id}))).into_response()
}
