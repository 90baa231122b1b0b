use base64::Engine;
use chrono::Utc;
use md5::{Digest, Md5};
use serde_json::Value as Json;
use subtle::ConstantTimeEq;
use vpnctl_core::{PaymentSource, TelegramUserId, VpnctlError};

use crate::engine::{admin_payment_message, extended_message, Controller};
use crate::Outcome;

const CHANNEL_NAME: &str = "Heleket";
const TRUSTED_IP: &str = "31.133.220.8";

/// Source B (crypto provider) webhook. Trust comes from two independent
/// layers: the sender's IP and an MD5 signature over the body with the
/// `sign` field stripped out.
impl Controller {
    pub async fn handle_crypto_webhook(
        &self,
        raw_body: &[u8],
        real_ip: Option<&str>,
        forwarded_for: Option<&str>,
    ) -> Result<Outcome, VpnctlError> {
        if !self.settings.heleket_webhook_disable_ip_check {
            let remote = real_ip
                .or_else(|| forwarded_for.map(|h| h.split(',').next().unwrap_or("").trim()))
                .unwrap_or("");
            if remote != TRUSTED_IP {
                return Err(VpnctlError::VerificationFailed(format!("untrusted crypto webhook source {remote}")));
            }
        }

        let mut body: Json = serde_json::from_slice(raw_body)
            .map_err(|e| VpnctlError::MalformedRequest(format!("malformed crypto webhook body: {e}")))?;

        self.verify_crypto_signature(&mut body)?;

        let uuid = body.get("uuid").and_then(Json::as_str).unwrap_or("").to_string();
        let status = body.get("status").and_then(Json::as_str);
        let payment_status = body.get("payment_status").and_then(Json::as_str);
        let effective_status = payment_status.or(status).unwrap_or("");
        let is_final = body
            .get("is_final")
            .and_then(Json::as_bool)
            .unwrap_or_else(|| matches!(effective_status, "paid" | "paid_over" | "cancel" | "fail" | "wrong_amount"));

        if !is_final || !matches!(effective_status, "paid" | "paid_over") {
            return Ok(Outcome::Ignored(format!("crypto payment {uuid} not final/paid ({effective_status})")));
        }

        let additional_data = body
            .get("additional_data")
            .and_then(Json::as_str)
            .and_then(|s| serde_json::from_str::<Json>(s).ok());

        let (Some(telegram_user_id), Some(tariff_code)) = additional_data
            .as_ref()
            .map(|d| {
                (
                    d.get("telegram_user_id").and_then(json_to_i64),
                    d.get("tariff_code").and_then(Json::as_str).map(str::to_string),
                )
            })
            .unwrap_or((None, None))
        else {
            return Ok(Outcome::Ignored("crypto webhook missing telegram_user_id/tariff_code".into()));
        };

        let days = match self.resolve_tariff_days(&tariff_code).await {
            Ok(d) => d,
            Err(_) => return Ok(Outcome::Ignored(format!("unknown crypto tariff_code {tariff_code}"))),
        };

        let event_name = format!("heleket_payment_paid_{uuid}");
        if self.store.event_already_processed(&event_name).await? {
            return Ok(Outcome::AlreadyProcessed);
        }

        let now = Utc::now();
        let heleket_sub = self
            .store
            .get_active_subscription_by_channel(telegram_user_id, CHANNEL_NAME, "heleket_")
            .await?;

        // Unlike the card provider, crypto extension falls back to ANY
        // active subscription for the user when none of this provider's own
        // subs exist — the original extends whatever channel is currently
        // active rather than forcing a replacement.
        let base_sub = match heleket_sub {
            Some(sub) => Some(sub),
            None => self
                .store
                .get_active_subscriptions_for_telegram(telegram_user_id)
                .await?
                .into_iter()
                .next(),
        };

        if let Some(base_sub) = base_sub {
            let base = base_sub.expires_at.max(now);
            let new_expires_at = base + chrono::Duration::days(days);
            let sub = self
                .store
                .update_subscription_expiration(base_sub.id, new_expires_at, &event_name)
                .await?;

            self.notify_admin(&admin_payment_message("Heleket extend", telegram_user_id, &tariff_code)).await;
            self.notify_user_best_effort(telegram_user_id, &extended_message(new_expires_at)).await;
            self.apply_referral_rewards_best_effort(telegram_user_id, sub.id, &tariff_code, PaymentSource::Crypto, Some(&uuid))
                .await;

            return Ok(Outcome::Extended { subscription_id: sub.id, new_expires_at });
        }

        let expires_at = now + chrono::Duration::days(days);
        self.deactivate_all_active(telegram_user_id, "auto_replace_heleket").await?;

        let period = format!("heleket_{tariff_code}");
        let sub = self
            .provision_new_subscription(0, 0, 0, 0, &period, CHANNEL_NAME, telegram_user_id, expires_at, &event_name)
            .await?;

        let config_text = self.gateway.build_client_config(&sub.client_private_key, &sub.client_ip);
        if let Err(e) = self.notifier.send_vpn_config(telegram_user_id, &config_text, None).await {
            tracing::warn!(error = %e, telegram_user_id, "user unreachable delivering new crypto config");
        }
        self.notify_admin(&admin_payment_message("Heleket new", telegram_user_id, &tariff_code)).await;
        self.apply_referral_rewards_best_effort(telegram_user_id, sub.id, &tariff_code, PaymentSource::Crypto, Some(&uuid))
            .await;

        Ok(Outcome::Created { subscription_id: sub.id })
    }

    fn verify_crypto_signature(&self, body: &mut Json) -> Result<(), VpnctlError> {
        if self.settings.heleket_webhook_disable_signature_check {
            return Ok(());
        }
        let key = &self.settings.heleket_api_payment_key;
        if key.is_empty() {
            return Err(VpnctlError::VerificationFailed("heleket signature key not configured".into()));
        }
        let Json::Object(map) = body else {
            return Err(VpnctlError::VerificationFailed("crypto webhook body not an object".into()));
        };
        let Some(Json::String(provided_sign)) = map.remove("sign") else {
            return Err(VpnctlError::VerificationFailed("crypto webhook missing sign field".into()));
        };

        let canonical = serde_json::to_string(&Json::Object(map.clone()))
            .map_err(|e| VpnctlError::VerificationFailed(format!("crypto webhook re-serialize failed: {e}")))?
            .replace('/', "\\/");

        let encoded = base64::engine::general_purpose::STANDARD.encode(canonical.as_bytes());
        let mut hasher = Md5::new();
        hasher.update(encoded.as_bytes());
        hasher.update(key.as_bytes());
        let expected = hex::encode(hasher.finalize());

        if expected.as_bytes().ct_eq(provided_sign.as_bytes()).unwrap_u8() != 1 {
            return Err(VpnctlError::VerificationFailed("crypto signature mismatch".into()));
        }
        map.insert("sign".to_string(), Json::String(provided_sign));
        Ok(())
    }
}

fn json_to_i64(value: &Json) -> Option<TelegramUserId> {
    match value {
        Json::Number(n) => n.as_i64(),
        Json::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_forward_slashes_like_the_original() {
        let s = r#"{"url":"https://a/b"}"#.replace('/', "\\/");
        assert_eq!(s, r#"{"url":"https:\/\/a\/b"}"#);
    }

    #[test]
    fn json_to_i64_accepts_string_or_number() {
        assert_eq!(json_to_i64(&Json::from(42)), Some(42));
        assert_eq!(json_to_i64(&Json::from("42")), Some(42));
    }

    #[test]
    fn reserializes_in_provider_insertion_order_not_alphabetical() {
        // Keys deliberately out of alphabetical order, as a real Heleket body
        // arrives. With `serde_json`'s `preserve_order` feature, a parsed
        // `Map` keeps this order on re-serialization instead of sorting it.
        let raw = r#"{"type":"payment","uuid":"abc","order_id":"1","amount":"10.00","status":"paid","sign":"deadbeef"}"#;
        let mut body: Json = serde_json::from_slice(raw.as_bytes()).unwrap();
        let Json::Object(map) = &mut body else { panic!("not an object") };
        map.remove("sign");
        let canonical = serde_json::to_string(&Json::Object(map.clone())).unwrap();
        assert_eq!(
            canonical,
            r#"{"type":"payment","uuid":"abc","order_id":"1","amount":"10.00","status":"paid"}"#
        );
    }
}
