use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value as Json;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use vpnctl_core::{PaymentSource, TelegramUserId, VpnctlError};

use crate::engine::Controller;
use crate::Outcome;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
struct LegacyEnvelope {
    name: String,
    payload: Json,
    created_at: Option<String>,
}

impl Controller {
    /// Source C (legacy provider) webhook: `HMAC-SHA256` over the raw body,
    /// hex-encoded, compared against the `trbt-signature` header.
    pub async fn handle_legacy_webhook(
        &self,
        raw_body: &[u8],
        signature_header: Option<&str>,
    ) -> Result<Outcome, VpnctlError> {
        self.verify_legacy_signature(raw_body, signature_header)?;

        let envelope: LegacyEnvelope = serde_json::from_slice(raw_body)
            .map_err(|e| VpnctlError::MalformedRequest(format!("malformed legacy webhook body: {e}")))?;

        match envelope.name.as_str() {
            "new_subscription" => self.handle_legacy_new_subscription(&envelope.payload).await,
            "new_donation" => self.handle_legacy_new_donation(&envelope.payload, envelope.created_at.as_deref()).await,
            "cancelled_subscription" => self.handle_legacy_cancelled_subscription(&envelope.payload).await,
            other => Ok(Outcome::Ignored(format!("unhandled legacy event {other}"))),
        }
    }

    fn verify_legacy_signature(&self, raw_body: &[u8], signature_header: Option<&str>) -> Result<(), VpnctlError> {
        let secret = &self.settings.tribute_webhook_secret;
        let Some(signature) = signature_header else {
            return Err(VpnctlError::VerificationFailed("missing trbt-signature header".into()));
        };
        if secret.is_empty() {
            return Err(VpnctlError::VerificationFailed("tribute webhook secret not configured".into()));
        }
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| VpnctlError::VerificationFailed(format!("bad hmac key: {e}")))?;
        mac.update(raw_body);
        let expected = hex::encode(mac.finalize().into_bytes());
        if expected.as_bytes().ct_eq(signature.as_bytes()).unwrap_u8() != 1 {
            return Err(VpnctlError::VerificationFailed("legacy signature mismatch".into()));
        }
        Ok(())
    }

    async fn handle_legacy_new_subscription(&self, payload: &Json) -> Result<Outcome, VpnctlError> {
        let tribute_user_id = field_i64(payload, "user_id")
            .ok_or_else(|| VpnctlError::VerificationFailed("new_subscription missing user_id".into()))?;
        let telegram_user_id = field_i64(payload, "telegram_user_id")
            .ok_or_else(|| VpnctlError::VerificationFailed("new_subscription missing telegram_user_id".into()))?;
        let subscription_id = field_i64(payload, "subscription_id").unwrap_or(0);
        let period_id = field_i64(payload, "period_id").unwrap_or(0);
        let channel_id = field_i64(payload, "channel_id").unwrap_or(0);
        let period = payload.get("period").and_then(Json::as_str).unwrap_or("").to_string();
        let channel_name = payload.get("channel_name").and_then(Json::as_str).unwrap_or("").to_string();
        let expires_at = payload
            .get("expires_at")
            .and_then(Json::as_str)
            .and_then(parse_legacy_datetime)
            .ok_or_else(|| VpnctlError::VerificationFailed("new_subscription missing/bad expires_at".into()))?;

        let event_name = "new_subscription";
        let existing = self
            .store
            .get_active_subscription_for_period(tribute_user_id, period_id, channel_id)
            .await?;

        if let Some(existing) = existing {
            let sub = self
                .store
                .update_subscription_expiration(existing.id, expires_at, event_name)
                .await?;
            self.notify_user_best_effort(
                telegram_user_id,
                "Подписка продлена, VPN-доступ уже активен.",
            )
            .await;
            self.apply_referral_rewards_best_effort(telegram_user_id, sub.id, &period, PaymentSource::Legacy, None)
                .await;
            return Ok(Outcome::Extended { subscription_id: sub.id, new_expires_at: expires_at });
        }

        let sub = self
            .provision_new_subscription(
                tribute_user_id,
                subscription_id,
                period_id,
                channel_id,
                &period,
                &channel_name,
                telegram_user_id,
                expires_at,
                event_name,
            )
            .await?;

        let config_text = self.gateway.build_client_config(&sub.client_private_key, &sub.client_ip);
        if let Err(e) = self
            .notifier
            .send_vpn_config(telegram_user_id, &config_text, Some("Спасибо за поддержку через Tribute!"))
            .await
        {
            tracing::warn!(error = %e, telegram_user_id, "user unreachable delivering new legacy config");
        }
        self.apply_referral_rewards_best_effort(telegram_user_id, sub.id, &period, PaymentSource::Legacy, None)
            .await;

        Ok(Outcome::Created { subscription_id: sub.id })
    }

    async fn handle_legacy_new_donation(&self, payload: &Json, created_at_header: Option<&str>) -> Result<Outcome, VpnctlError> {
        let tribute_user_id = field_i64(payload, "user_id")
            .ok_or_else(|| VpnctlError::VerificationFailed("new_donation missing user_id".into()))?;
        let telegram_user_id = field_i64(payload, "telegram_user_id")
            .ok_or_else(|| VpnctlError::VerificationFailed("new_donation missing telegram_user_id".into()))?;
        let subscription_id = field_i64(payload, "donation_request_id").unwrap_or(0);
        let period = payload.get("period").and_then(Json::as_str).unwrap_or("monthly").to_string();
        let channel_name = payload.get("donation_name").and_then(Json::as_str).unwrap_or("donation").to_string();

        let existing = self
            .store
            .get_subscription_by_tribute_and_subscription_id(tribute_user_id, subscription_id)
            .await?;

        if let Some(existing) = existing {
            if existing.is_active && existing.last_event_name.as_deref() == Some("new_donation") {
                // Exact duplicate: resend the same config, mutate nothing.
                let config_text = self.gateway.build_client_config(&existing.client_private_key, &existing.client_ip);
                if let Err(e) = self
                    .notifier
                    .send_vpn_config(telegram_user_id, &config_text, Some("Повторно отправляем VPN-конфиг."))
                    .await
                {
                    tracing::warn!(error = %e, telegram_user_id, "user unreachable resending donation config");
                }
                return Ok(Outcome::AlreadyProcessed);
            }
        }

        let created_at = created_at_header
            .and_then(parse_legacy_datetime)
            .unwrap_or_else(Utc::now);
        let expires_at = created_at + chrono::Duration::days(30);

        let sub = self
            .provision_new_subscription(
                tribute_user_id,
                subscription_id,
                0,
                0,
                &period,
                &channel_name,
                telegram_user_id,
                expires_at,
                "new_donation",
            )
            .await?;

        let config_text = self.gateway.build_client_config(&sub.client_private_key, &sub.client_ip);
        if let Err(e) = self
            .notifier
            .send_vpn_config(telegram_user_id, &config_text, Some("Спасибо за поддержку через Tribute!"))
            .await
        {
            tracing::warn!(error = %e, telegram_user_id, "user unreachable delivering new donation config");
        }
        self.apply_referral_rewards_best_effort(telegram_user_id, sub.id, &period, PaymentSource::Legacy, None)
            .await;

        Ok(Outcome::Created { subscription_id: sub.id })
    }

    async fn handle_legacy_cancelled_subscription(&self, payload: &Json) -> Result<Outcome, VpnctlError> {
        let tribute_user_id = field_i64(payload, "user_id")
            .ok_or_else(|| VpnctlError::VerificationFailed("cancelled_subscription missing user_id".into()))?;
        let telegram_user_id = field_i64(payload, "telegram_user_id");
        let period_id = field_i64(payload, "period_id").unwrap_or(0);
        let channel_id = field_i64(payload, "channel_id").unwrap_or(0);

        let deactivated = self
            .store
            .deactivate_subscriptions_for_period(tribute_user_id, period_id, channel_id, "cancelled_subscription")
            .await?;

        for sub in &deactivated {
            if let Err(e) = self.gateway.remove_peer(&sub.client_public_key).await {
                tracing::warn!(error = %e, subscription_id = sub.id, "failed to remove gateway peer on cancellation");
            }
        }

        if let Some(telegram_user_id) = telegram_user_id {
            self.notify_user_best_effort(
                telegram_user_id,
                "Подписка в Tribute отменена. VPN-доступ отключён.",
            )
            .await;
        }

        match deactivated.into_iter().next() {
            Some(sub) => Ok(Outcome::Deactivated { subscription_id: sub.id }),
            None => Ok(Outcome::Ignored("cancelled_subscription: nothing active to deactivate".into())),
        }
    }
}

fn field_i64(payload: &Json, key: &str) -> Option<TelegramUserId> {
    match payload.get(key)? {
        Json::Number(n) => n.as_i64(),
        Json::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn parse_legacy_datetime(s: &str) -> Option<DateTime<Utc>> {
    let normalized = if let Some(stripped) = s.strip_suffix('Z') {
        format!("{stripped}+00:00")
    } else {
        s.to_string()
    };
    DateTime::parse_from_rfc3339(&normalized).ok().map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_z_suffixed_timestamps() {
        let dt = parse_legacy_datetime("2025-06-01T00:00:00Z").unwrap();
        assert_eq!(dt.format("%Y-%m-%d").to_string(), "2025-06-01");
    }

    #[test]
    fn field_i64_accepts_string_or_number() {
        let payload = serde_json::json!({"a": 7, "b": "7"});
        assert_eq!(field_i64(&payload, "a"), Some(7));
        assert_eq!(field_i64(&payload, "b"), Some(7));
        assert_eq!(field_i64(&payload, "missing"), None);
    }
}
