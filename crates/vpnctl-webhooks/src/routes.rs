use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;
use tracing::warn;
use vpnctl_core::VpnctlError;
use vpnctl_controller::Outcome;

use crate::WebhookState;

pub fn router() -> Router<Arc<WebhookState>> {
    Router::new()
        .route("/webhooks/card", post(card_webhook))
        .route("/webhooks/crypto", post(crypto_webhook))
        .route("/webhooks/tribute", post(tribute_webhook))
}

async fn card_webhook(State(state): State<Arc<WebhookState>>, body: Bytes) -> Response {
    respond(state.controller.handle_card_webhook(&body).await)
}

async fn crypto_webhook(State(state): State<Arc<WebhookState>>, headers: HeaderMap, body: Bytes) -> Response {
    let real_ip = headers.get("x-real-ip").and_then(|v| v.to_str().ok());
    let forwarded_for = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok());
    respond(state.controller.handle_crypto_webhook(&body, real_ip, forwarded_for).await)
}

async fn tribute_webhook(State(state): State<Arc<WebhookState>>, headers: HeaderMap, body: Bytes) -> Response {
    let signature = headers.get("trbt-signature").and_then(|v| v.to_str().ok());
    respond(state.controller.handle_legacy_webhook(&body, signature).await)
}

/// Every provider webhook funnels through this: business-level rejections
/// ([`Outcome::Ignored`]/[`Outcome::AlreadyProcessed`]) are still a 200 —
/// only malformed input or an internal failure gets a non-2xx status, so a
/// retrying provider never sees a reason to keep retrying a request this
/// service has already made a final decision about.
///
/// [`VpnctlError::VerificationFailed`] (bad signature, untrusted source IP,
/// out-of-band re-check disagreement) also returns 200: a 4xx there would
/// hand an attacker a signature-verification oracle. Only a genuinely
/// malformed body — we can't even parse the event out of it — is a 4xx.
fn respond(result: Result<Outcome, VpnctlError>) -> Response {
    match result {
        Ok(outcome) => (StatusCode::OK, Json(json!({"status": "ok", "outcome": describe(&outcome)}))).into_response(),
        Err(e @ VpnctlError::MalformedRequest(_)) => {
            warn!(error = %e, "webhook body malformed");
            (StatusCode::BAD_REQUEST, Json(json!({"status": "error", "error": e.to_string()}))).into_response()
        }
        Err(e @ VpnctlError::VerificationFailed(_)) => {
            warn!(error = %e, "webhook verification failed");
            (StatusCode::OK, Json(json!({"status": "ok", "outcome": "rejected"}))).into_response()
        }
        Err(e @ (VpnctlError::GatewayDown(_) | VpnctlError::NoFreeAddresses)) => {
            warn!(error = %e, "webhook handling hit a gateway failure, provider should retry");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"status": "error", "error": "internal error"}))).into_response()
        }
        Err(e @ (VpnctlError::Database(_) | VpnctlError::Migration(_))) => {
            warn!(error = %e, "webhook handling hit a storage error");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"status": "error", "error": "internal error"}))).into_response()
        }
        Err(e) => {
            warn!(error = %e, "unexpected webhook error");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"status": "error", "error": "internal error"}))).into_response()
        }
    }
}

fn describe(outcome: &Outcome) -> String {
    match outcome {
        Outcome::Created { subscription_id } => format!("created:{subscription_id}"),
        Outcome::Extended { subscription_id, .. } => format!("extended:{subscription_id}"),
        Outcome::Revived { subscription_id } => format!("revived:{subscription_id}"),
        Outcome::Deactivated { subscription_id } => format!("deactivated:{subscription_id}"),
        Outcome::Shortened { subscription_id, .. } => format!("shortened:{subscription_id}"),
        Outcome::AlreadyProcessed => "already_processed".to_string(),
        Outcome::Ignored(reason) => format!("ignored:{reason}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn describes_each_outcome_variant() {
        assert_eq!(describe(&Outcome::AlreadyProcessed), "already_processed");
        assert_eq!(describe(&Outcome::Ignored("unknown tariff".into())), "ignored:unknown tariff");
        assert_eq!(describe(&Outcome::Created { subscription_id: 7 }), "created:7");
        assert_eq!(
            describe(&Outcome::Extended { subscription_id: 3, new_expires_at: Utc::now() }),
            "extended:3"
        );
    }
}
