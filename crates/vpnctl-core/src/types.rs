use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Telegram numeric user id. Telegram ids fit in i64 but are never negative
/// in practice for private chats.
pub type TelegramUserId = i64;

// ── PaymentSource ────────────────────────────────────────────────────────────

/// Which upstream integration produced a [`CanonicalEvent`].
///
/// Mirrors the three webhook surfaces the control plane exposes: a card
/// processor (Source A / YooKassa), a crypto processor (Source B / Heleket)
/// and the legacy subscription/donation channel (Source C / Tribute).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentSource {
    Card,
    Crypto,
    Legacy,
    Points,
    Promo,
    Referral,
}

/// Feeds `user_points_transactions.source` directly, so these strings are
/// the provider-name vocabulary the ledger actually uses
/// (`yookassa`/`heleket`/`tribute`/`manual`/`points`), not the enum's own
/// variant names.
impl fmt::Display for PaymentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PaymentSource::Card => "yookassa",
            PaymentSource::Crypto => "heleket",
            PaymentSource::Legacy => "tribute",
            PaymentSource::Points => "points",
            PaymentSource::Promo => "manual",
            PaymentSource::Referral => "manual",
        };
        write!(f, "{s}")
    }
}

// ── CanonicalEvent ───────────────────────────────────────────────────────────

/// The provider-agnostic shape every verifier normalizes into before handing
/// off to the transition engine. One canonical event always maps to exactly
/// one transition decision.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CanonicalEvent {
    /// Globally unique string used for the idempotency gate
    /// (`last_event_name` column). Callers must derive this deterministically
    /// from provider-supplied ids so retried webhook deliveries collapse.
    pub event_name: String,
    pub source: PaymentSource,
    pub telegram_user_id: TelegramUserId,
    pub tariff_code: Option<String>,
    /// Provider's own expiry timestamp, when the provider is authoritative
    /// about the subscription period (e.g. a recurring card subscription).
    pub provider_expires_at: Option<DateTime<Utc>>,
    /// Fixed number of days to extend by, when the provider has no native
    /// period concept (flat donations, promo codes).
    pub extra_days: Option<i64>,
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub is_refund: bool,
    pub is_cancellation: bool,
    /// Legacy (Source C) correlation keys used to bulk-deactivate a group of
    /// subscriptions on a `cancelled_subscription` event.
    pub legacy_period_id: Option<i64>,
    pub legacy_channel_id: Option<i64>,
    pub legacy_tribute_user_id: Option<i64>,
}

// ── Subscription ─────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub tribute_user_id: i64,
    pub subscription_id: i64,
    pub period_id: i64,
    pub channel_id: i64,
    pub period: String,
    pub channel_name: String,
    pub telegram_user_id: TelegramUserId,
    pub client_private_key: String,
    pub client_public_key: String,
    pub client_ip: String,
    pub is_active: bool,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_event_name: Option<String>,
}

// ── Tariff ───────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tariff {
    pub code: String,
    pub days: i64,
    pub price: Decimal,
    pub points_price: Option<i64>,
    pub is_active: bool,
    pub ref_enabled: bool,
    pub ref_base_bonus_points: i64,
}

// ── Points / referrals ───────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserPoints {
    pub telegram_user_id: TelegramUserId,
    pub balance: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PointsTransaction {
    pub id: i64,
    pub telegram_user_id: TelegramUserId,
    pub delta: i64,
    pub reason: String,
    pub source: String,
    pub related_subscription_id: Option<i64>,
    pub related_payment_id: Option<String>,
    pub level: Option<i32>,
    pub meta: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Referral {
    pub referred_telegram_user_id: TelegramUserId,
    pub referrer_telegram_user_id: TelegramUserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReferralCode {
    pub code: String,
    pub referrer_telegram_user_id: TelegramUserId,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReferralLevel {
    pub level: i32,
    pub multiplier: Decimal,
    pub is_active: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserProfile {
    pub telegram_user_id: TelegramUserId,
    pub telegram_username: Option<String>,
    pub is_referral_blocked: bool,
    pub is_banned: bool,
    pub created_at: DateTime<Utc>,
}

/// Per-level downline counters computed for `/ref` — how many people the
/// user brought in at each level, and how many of those paid at least once.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ReferralInfo {
    pub ref_code: String,
    pub invited_count: i64,
    pub paid_referrals_count: i64,
    pub invited_by_levels: std::collections::BTreeMap<i32, i64>,
    pub paid_by_levels: std::collections::BTreeMap<i32, i64>,
}

// ── Promo codes ──────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromoTariffScope {
    Any,
    Allowlist,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PromoCode {
    pub id: i64,
    pub code: String,
    pub extra_days: i32,
    pub is_multi_use: bool,
    pub max_uses: Option<i32>,
    pub per_user_limit: Option<i32>,
    pub used_count: i32,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub tariff_scope: PromoTariffScope,
    pub allowed_tariffs: Vec<String>,
    pub allowed_telegram_id: Option<TelegramUserId>,
    pub is_active: bool,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub created_by_admin_id: Option<TelegramUserId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PromoCodeUsage {
    pub id: i64,
    pub promo_code_id: i64,
    pub telegram_user_id: TelegramUserId,
    pub subscription_id: Option<i64>,
    pub used_at: DateTime<Utc>,
}

/// Parameters for admin-side bulk code generation. Not used on the live
/// webhook/controller path — see `vpnctl-store::promo::admin`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PromoGenerationParams {
    pub count: u32,
    pub code_length: u32,
    pub extra_days: i32,
    pub is_multi_use: bool,
    pub max_uses: Option<i32>,
    pub per_user_limit: Option<i32>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub tariff_scope: PromoTariffScope,
    pub allowed_tariffs: Vec<String>,
    pub allowed_telegram_id: Option<TelegramUserId>,
    pub comment: Option<String>,
    pub created_by_admin_id: Option<TelegramUserId>,
    pub manual_codes: Vec<String>,
}

// ── Notifications ────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriptionNotification {
    pub id: i64,
    pub subscription_id: i64,
    pub notification_type: String,
    pub telegram_user_id: TelegramUserId,
    pub expires_at: DateTime<Utc>,
    pub sent_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_source_displays_as_ledger_provider_name() {
        assert_eq!(PaymentSource::Card.to_string(), "yookassa");
        assert_eq!(PaymentSource::Crypto.to_string(), "heleket");
        assert_eq!(PaymentSource::Legacy.to_string(), "tribute");
        assert_eq!(PaymentSource::Points.to_string(), "points");
    }
}
