use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value as Json;
use std::str::FromStr;
use vpnctl_core::{PaymentSource, TelegramUserId, VpnctlError};

use crate::engine::{admin_payment_message, extended_message, Controller};
use crate::Outcome;

const CHANNEL_NAME: &str = "YooKassa";

#[derive(Debug, Deserialize)]
struct CardWebhookBody {
    event: String,
    #[serde(rename = "object")]
    object: Json,
}

#[derive(Debug, Deserialize)]
struct CardMetadata {
    telegram_user_id: Option<Json>,
    tariff_code: Option<String>,
    telegram_user_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CardAmount {
    value: Option<String>,
    currency: Option<String>,
}

/// Shape of the card provider's `GET /v3/payments/<id>` response, used for
/// out-of-band re-verification — the webhook body itself is never trusted.
#[derive(Debug, Deserialize)]
struct CardApiPayment {
    status: Option<String>,
    paid: Option<bool>,
    metadata: Option<CardMetadata>,
    amount: Option<CardAmount>,
    refunded_amount: Option<CardAmount>,
    created_at: Option<String>,
}

impl Controller {
    /// Source A (card provider) webhook entry point. The webhook carries no
    /// signature; trust is established entirely by the out-of-band
    /// re-verification GET against the provider's own API.
    pub async fn handle_card_webhook(&self, raw_body: &[u8]) -> Result<Outcome, VpnctlError> {
        let body: CardWebhookBody = serde_json::from_slice(raw_body)
            .map_err(|e| VpnctlError::MalformedRequest(format!("malformed card webhook body: {e}")))?;

        match body.event.as_str() {
            "payment.succeeded" => self.handle_card_payment_succeeded(&body.object).await,
            "payment.canceled" => self.handle_card_payment_canceled(&body.object).await,
            "refund.succeeded" => self.handle_card_refund_succeeded(&body.object).await,
            other => Ok(Outcome::Ignored(format!("unhandled card event {other}"))),
        }
    }

    async fn fetch_payment_from_provider(&self, payment_id: &str) -> Option<CardApiPayment> {
        let url = format!("https://api.yookassa.ru/v3/payments/{payment_id}");
        let resp = self
            .http
            .get(&url)
            .basic_auth(&self.settings.yookassa_shop_id, Some(&self.settings.yookassa_secret_key))
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        resp.json::<CardApiPayment>().await.ok()
    }

    async fn handle_card_payment_succeeded(&self, object: &Json) -> Result<Outcome, VpnctlError> {
        let payment_id = object
            .get("id")
            .and_then(Json::as_str)
            .ok_or_else(|| VpnctlError::VerificationFailed("card webhook missing payment id".into()))?
            .to_string();

        let metadata: CardMetadata = object
            .get("metadata")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| VpnctlError::VerificationFailed(format!("bad metadata: {e}")))?
            .unwrap_or(CardMetadata {
                telegram_user_id: None,
                tariff_code: None,
                telegram_user_name: None,
            });

        let (Some(telegram_user_id), Some(tariff_code)) =
            (json_to_i64(metadata.telegram_user_id.as_ref()), metadata.tariff_code.clone())
        else {
            return Ok(Outcome::Ignored("card webhook missing telegram_user_id/tariff_code".into()));
        };

        let days = match self.resolve_tariff_days(&tariff_code).await {
            Ok(d) => d,
            Err(_) => return Ok(Outcome::Ignored(format!("unknown card tariff_code {tariff_code}"))),
        };

        // Out-of-band re-verification: the webhook is never trusted by itself.
        let Some(api_payment) = self.fetch_payment_from_provider(&payment_id).await else {
            return Ok(Outcome::Ignored(format!("could not verify card payment {payment_id}")));
        };

        if api_payment.status.as_deref() != Some("succeeded") || api_payment.paid != Some(true) {
            return Ok(Outcome::Ignored(format!("card payment {payment_id} not succeeded/paid")));
        }

        let api_metadata = api_payment.metadata.unwrap_or(CardMetadata {
            telegram_user_id: None,
            tariff_code: None,
            telegram_user_name: None,
        });
        let api_amount = api_payment.amount.unwrap_or(CardAmount { value: None, currency: None });
        let api_refunded = api_payment
            .refunded_amount
            .and_then(|a| a.value)
            .and_then(|v| Decimal::from_str(&v).ok())
            .unwrap_or(Decimal::ZERO);

        if api_amount.currency.as_deref() != Some("RUB") {
            return Ok(Outcome::Ignored(format!("card payment {payment_id} wrong currency")));
        }
        if api_refunded > Decimal::ZERO {
            return Ok(Outcome::Ignored(format!("card payment {payment_id} already refunded")));
        }
        if json_to_i64(api_metadata.telegram_user_id.as_ref()) != Some(telegram_user_id)
            || api_metadata.tariff_code.as_deref() != Some(tariff_code.as_str())
        {
            return Ok(Outcome::Ignored(format!("card payment {payment_id} metadata mismatch")));
        }

        // Amount mismatch is not fatal (prices change server-side without a
        // code deploy) but is worth a sanity-log against the known table.
        if let Some(expected) = crate::tariffs::fallback_amount_rub(&tariff_code) {
            if let Some(actual) = api_amount.value.as_deref().and_then(|v| Decimal::from_str(v).ok()) {
                if actual != expected {
                    tracing::warn!(
                        payment_id = %payment_id,
                        tariff_code = %tariff_code,
                        expected = %expected,
                        actual = %actual,
                        "card payment amount differs from fallback price table"
                    );
                }
            }
        }

        let event_name = format!("yookassa_payment_succeeded_{payment_id}");
        if self.store.event_already_processed(&event_name).await? {
            return Ok(Outcome::AlreadyProcessed);
        }

        let now = Utc::now();
        let existing = self
            .store
            .get_active_subscription_by_channel(telegram_user_id, CHANNEL_NAME, "yookassa_")
            .await?;

        if let Some(existing) = existing {
            // Stale-payment guard: a different payment id already produced this row.
            if let Some(last_event) = &existing.last_event_name {
                let prefix = "yookassa_payment_succeeded_";
                if let Some(last_payment_id) = last_event.strip_prefix(prefix) {
                    if last_payment_id != payment_id {
                        if let Some(last_payment) = self.fetch_payment_from_provider(last_payment_id).await {
                            if let (Some(current_created), Some(last_created)) = (
                                api_payment.created_at.as_deref().and_then(parse_card_datetime),
                                last_payment.created_at.as_deref().and_then(parse_card_datetime),
                            ) {
                                if current_created <= last_created {
                                    return Ok(Outcome::Ignored(format!("stale card payment {payment_id}, not extended")));
                                }
                            }
                        }
                    }
                }
            }

            let base = existing.expires_at.max(now);
            let new_expires_at = base + chrono::Duration::days(days);
            let sub = self
                .store
                .update_subscription_expiration(existing.id, new_expires_at, &event_name)
                .await?;

            self.notify_admin(&admin_payment_message("YooKassa extend", telegram_user_id, &tariff_code)).await;
            self.notify_user_best_effort(telegram_user_id, &extended_message(new_expires_at)).await;
            self.apply_referral_rewards_best_effort(telegram_user_id, sub.id, &tariff_code, PaymentSource::Card, Some(&payment_id))
                .await;

            return Ok(Outcome::Extended { subscription_id: sub.id, new_expires_at });
        }

        let expires_at = now + chrono::Duration::days(days);
        self.deactivate_all_active(telegram_user_id, "auto_replace_yookassa").await?;

        let period = format!("yookassa_{tariff_code}");
        let sub = self
            .provision_new_subscription(0, 0, 0, 0, &period, CHANNEL_NAME, telegram_user_id, expires_at, &event_name)
            .await?;

        let config_text = self.gateway.build_client_config(&sub.client_private_key, &sub.client_ip);
        if let Err(e) = self.notifier.send_vpn_config(telegram_user_id, &config_text, None).await {
            tracing::warn!(error = %e, telegram_user_id, "user unreachable delivering new card config");
        }
        self.notify_admin(&admin_payment_message("YooKassa new", telegram_user_id, &tariff_code)).await;
        self.apply_referral_rewards_best_effort(telegram_user_id, sub.id, &tariff_code, PaymentSource::Card, Some(&payment_id))
            .await;

        Ok(Outcome::Created { subscription_id: sub.id })
    }

    async fn handle_card_payment_canceled(&self, object: &Json) -> Result<Outcome, VpnctlError> {
        let Some(payment_id) = object.get("id").and_then(Json::as_str) else {
            return Ok(Outcome::Ignored("card cancel missing payment id".into()));
        };
        let success_event_name = format!("yookassa_payment_succeeded_{payment_id}");
        let Some(sub) = self.store.get_subscription_by_event(&success_event_name).await? else {
            return Ok(Outcome::Ignored(format!("no subscription for canceled payment {payment_id}")));
        };
        let event_name = format!("yookassa_payment_canceled_{payment_id}");
        match self.deactivate_and_remove_peer(sub.id, &event_name).await? {
            Some(deactivated) => Ok(Outcome::Deactivated { subscription_id: deactivated.id }),
            None => Ok(Outcome::AlreadyProcessed),
        }
    }

    async fn handle_card_refund_succeeded(&self, object: &Json) -> Result<Outcome, VpnctlError> {
        let Some(refund_id) = object.get("id").and_then(Json::as_str) else {
            return Ok(Outcome::Ignored("card refund missing refund id".into()));
        };
        let refund_event_name = format!("yookassa_refund_succeeded_{refund_id}");
        if self.store.event_already_processed(&refund_event_name).await? {
            return Ok(Outcome::AlreadyProcessed);
        }

        let Some(refund_payment_id) = object.get("payment_id").and_then(Json::as_str) else {
            return Ok(Outcome::Ignored("card refund missing original payment_id".into()));
        };

        let refund_amount = object
            .get("amount")
            .and_then(|a| a.get("value"))
            .and_then(Json::as_str)
            .and_then(|v| Decimal::from_str(v).ok())
            .unwrap_or(Decimal::ZERO);

        let Some(api_payment) = self.fetch_payment_from_provider(refund_payment_id).await else {
            return Ok(Outcome::Ignored(format!("refund: could not fetch original payment {refund_payment_id}")));
        };
        let api_metadata = api_payment.metadata.unwrap_or(CardMetadata {
            telegram_user_id: None,
            tariff_code: None,
            telegram_user_name: None,
        });
        let total_amount = api_payment
            .amount
            .and_then(|a| a.value)
            .and_then(|v| Decimal::from_str(&v).ok())
            .unwrap_or(Decimal::ZERO);
        let tariff_code_from_payment = api_metadata.tariff_code.clone();

        let success_event_name = format!("yookassa_payment_succeeded_{refund_payment_id}");
        let mut sub = self.store.get_subscription_by_event(&success_event_name).await?;

        if sub.is_none() {
            if let Some(tg_id) = json_to_i64(api_metadata.telegram_user_id.as_ref()) {
                let actives = self.store.get_active_subscriptions_for_telegram(tg_id).await?;
                sub = actives
                    .into_iter()
                    .find(|s| s.channel_name == CHANNEL_NAME || s.period.starts_with("yookassa_"));
            }
        }

        let Some(sub) = sub else {
            return Ok(Outcome::Ignored(format!("refund: no subscription found for {refund_payment_id}")));
        };

        let days_for_tariff = tariff_code_from_payment
            .as_deref()
            .and_then(crate::tariffs::fallback_days)
            .or_else(|| {
                sub.period
                    .strip_prefix("yookassa_")
                    .and_then(crate::tariffs::fallback_days)
            });

        let Some(days_for_tariff) = days_for_tariff else {
            match self.deactivate_and_remove_peer(sub.id, &refund_event_name).await? {
                Some(d) => return Ok(Outcome::Deactivated { subscription_id: d.id }),
                None => return Ok(Outcome::AlreadyProcessed),
            }
        };

        let days_to_revert = if total_amount <= Decimal::ZERO || refund_amount <= Decimal::ZERO {
            days_for_tariff
        } else {
            let mut ratio = refund_amount / total_amount;
            if ratio > Decimal::ONE {
                ratio = Decimal::ONE;
            }
            let mut days = (Decimal::from(days_for_tariff) * ratio).trunc().to_string().parse::<i64>().unwrap_or(0);
            if days <= 0 && refund_amount > Decimal::ZERO {
                days = 1;
            }
            days
        };

        let now = Utc::now();
        let new_expires_at = sub.expires_at - chrono::Duration::days(days_to_revert);

        if new_expires_at <= now {
            match self.deactivate_and_remove_peer(sub.id, &refund_event_name).await? {
                Some(d) => Ok(Outcome::Deactivated { subscription_id: d.id }),
                None => Ok(Outcome::AlreadyProcessed),
            }
        } else {
            let updated = self
                .store
                .update_subscription_expiration(sub.id, new_expires_at, &refund_event_name)
                .await?;
            Ok(Outcome::Shortened { subscription_id: updated.id, new_expires_at })
        }
    }
}

fn json_to_i64(value: Option<&Json>) -> Option<TelegramUserId> {
    match value? {
        Json::Number(n) => n.as_i64(),
        Json::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn parse_card_datetime(s: &str) -> Option<DateTime<Utc>> {
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
        let dt = parse_card_datetime("2025-03-20T01:15:58.332460Z").unwrap();
        assert_eq!(dt.format("%Y-%m-%d").to_string(), "2025-03-20");
    }

    #[test]
    fn json_to_i64_accepts_string_or_number() {
        assert_eq!(json_to_i64(Some(&Json::from(100))), Some(100));
        assert_eq!(json_to_i64(Some(&Json::from("100"))), Some(100));
        assert_eq!(json_to_i64(None), None);
    }
}
