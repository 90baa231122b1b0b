use std::sync::Arc;

use chrono::{DateTime, Utc};
use vpnctl_core::{Settings, Subscription, TelegramUserId, VpnctlError};
use vpnctl_notify::Notifier;
use vpnctl_points::PointsEngine;
use vpnctl_store::Store;
use vpnctl_wireguard::Gateway;

/// Result of one Controller transition, returned to the webhook layer so it
/// can pick an HTTP status without knowing any transition internals.
#[derive(Debug, Clone)]
pub enum Outcome {
    Created { subscription_id: i64 },
    Extended { subscription_id: i64, new_expires_at: DateTime<Utc> },
    Revived { subscription_id: i64 },
    Deactivated { subscription_id: i64 },
    Shortened { subscription_id: i64, new_expires_at: DateTime<Utc> },
    /// Same `event_name` seen before; no side effect this time.
    AlreadyProcessed,
    /// Acknowledged but deliberately not acted on (unknown tariff, ignored
    /// event type, test-mode payment, …) — always maps to an HTTP 200.
    Ignored(String),
}

/// Mediates between provider-specific webhook shapes and the canonical
/// transition set. One struct, one impl block per provider (`card.rs`,
/// `crypto.rs`, `legacy.rs`), plus the bot-driven paths (`points.rs`,
/// `promo.rs`) — the same "one struct, many files of impls" shape
/// `vpnctl-store` uses for `Store`.
#[derive(Clone)]
pub struct Controller {
    pub(crate) store: Arc<Store>,
    pub(crate) gateway: Gateway,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) points: PointsEngine,
    pub(crate) http: reqwest::Client,
    pub(crate) settings: Arc<Settings>,
}

impl Controller {
    pub fn new(
        store: Arc<Store>,
        gateway: Gateway,
        notifier: Arc<dyn Notifier>,
        points: PointsEngine,
        settings: Arc<Settings>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(12))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            store,
            gateway,
            notifier,
            points,
            http,
            settings,
        }
    }

    /// Resolves a tariff's duration via the Store, falling back to the
    /// hard-coded table (and logging) when the row is missing or the Store
    /// call itself failed — a transient Store outage must not block
    /// provisioning a tariff whose duration is common knowledge.
    pub(crate) async fn resolve_tariff_days(&self, tariff_code: &str) -> Result<i64, VpnctlError> {
        match self.store.get_tariff_by_code(tariff_code).await {
            Ok(Some(tariff)) => Ok(tariff.days),
            Ok(None) => crate::tariffs::fallback_days(tariff_code)
                .ok_or_else(|| VpnctlError::TariffNotFoundOrInactive(tariff_code.to_string())),
            Err(e) => crate::tariffs::fallback_days(tariff_code).ok_or(e),
        }
    }

    /// Generates a keypair, allocates an IP under the advisory lock, adds
    /// the gateway peer, and inserts the subscription row — in that order,
    /// per §5's ordering guarantee ((c) peer add precedes (d) DB commit).
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn provision_new_subscription(
        &self,
        tribute_user_id: i64,
        subscription_id: i64,
        period_id: i64,
        channel_id: i64,
        period: &str,
        channel_name: &str,
        telegram_user_id: TelegramUserId,
        expires_at: DateTime<Utc>,
        event_name: &str,
    ) -> Result<Subscription, VpnctlError> {
        let (client_private_key, client_public_key) = self.gateway.generate_keypair().await?;

        let mut guard = self.store.acquire_ip_alloc_lock().await?;
        let client_ip = self.gateway.allocate_ip(&self.store, &mut guard).await?;
        self.gateway
            .add_peer(&client_public_key, &format!("{client_ip}/32"), Some(telegram_user_id))
            .await?;

        let sub = self
            .store
            .insert_subscription(
                tribute_user_id,
                subscription_id,
                period_id,
                channel_id,
                period,
                channel_name,
                telegram_user_id,
                &client_private_key,
                &client_public_key,
                &client_ip,
                expires_at,
                event_name,
            )
            .await?;
        guard.release().await?;
        Ok(sub)
    }

    /// Re-adds a previously torn-down peer (keypair and IP reused verbatim)
    /// and inserts a fresh row for it. T-Revive-Reuse: no new config is
    /// generated or sent, since the client already has the matching file.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn revive_subscription(
        &self,
        prior: &Subscription,
        telegram_user_id: TelegramUserId,
        expires_at: DateTime<Utc>,
        event_name: &str,
    ) -> Result<Subscription, VpnctlError> {
        self.gateway
            .add_peer(&prior.client_public_key, &format!("{}/32", prior.client_ip), Some(telegram_user_id))
            .await?;

        self.store
            .insert_subscription(
                prior.tribute_user_id,
                prior.subscription_id,
                prior.period_id,
                prior.channel_id,
                &prior.period,
                &prior.channel_name,
                telegram_user_id,
                &prior.client_private_key,
                &prior.client_public_key,
                &prior.client_ip,
                expires_at,
                event_name,
            )
            .await
    }

    /// T-Deactivate: flips the row inactive and tears down its gateway
    /// peer. A no-op (`Ok(None)`) if the row was already inactive.
    pub(crate) async fn deactivate_and_remove_peer(
        &self,
        subscription_id: i64,
        event_name: &str,
    ) -> Result<Option<Subscription>, VpnctlError> {
        let Some(sub) = self
            .store
            .deactivate_subscription_by_id(subscription_id, event_name)
            .await?
        else {
            return Ok(None);
        };
        if let Err(e) = self.gateway.remove_peer(&sub.client_public_key).await {
            tracing::warn!(error = %e, subscription_id, "failed to remove gateway peer on deactivation");
        }
        Ok(Some(sub))
    }

    /// Deactivates every active subscription for the user and tears down
    /// their peers — used by the card/crypto T-Create path right before
    /// provisioning a replacement, mirroring the original's
    /// `auto_replace_yookassa`/`auto_replace_heleket` reasons.
    ///
    /// `last_event_name` is unique across the whole table, so a user with
    /// more than one active row (e.g. one per channel) can't all be stamped
    /// with the same literal reason — each gets the reason qualified by its
    /// own subscription id instead.
    pub(crate) async fn deactivate_all_active(
        &self,
        telegram_user_id: TelegramUserId,
        reason: &str,
    ) -> Result<(), VpnctlError> {
        let actives = self
            .store
            .get_active_subscriptions_for_telegram(telegram_user_id)
            .await?;
        for sub in actives {
            let event_name = format!("{reason}_{}", sub.id);
            self.deactivate_and_remove_peer(sub.id, &event_name).await?;
        }
        Ok(())
    }

    /// Best-effort admin ping; never fails the caller.
    pub(crate) async fn notify_admin(&self, text: &str) {
        self.notifier
            .notify_admin(self.settings.admin_telegram_id, text)
            .await;
    }

    /// Best-effort user message; `UserUnreachable` is logged, never
    /// propagated — a blocked bot must not roll back a paid transition.
    pub(crate) async fn notify_user_best_effort(&self, telegram_user_id: TelegramUserId, text: &str) {
        if let Err(e) = self.notifier.send_text(telegram_user_id, text).await {
            tracing::warn!(error = %e, telegram_user_id, "user unreachable on Telegram");
        }
    }

    /// Referral credit is always best-effort relative to the provisioning
    /// transition: a failure here must not roll back T-Create/T-Extend.
    pub(crate) async fn apply_referral_rewards_best_effort(
        &self,
        payer_telegram_user_id: TelegramUserId,
        subscription_id: i64,
        tariff_code: &str,
        payment_source: vpnctl_core::PaymentSource,
        payment_id: Option<&str>,
    ) {
        if let Err(e) = self
            .points
            .apply_referral_rewards(payer_telegram_user_id, subscription_id, tariff_code, payment_source, payment_id)
            .await
        {
            tracing::warn!(error = %e, payer_telegram_user_id, "referral reward distribution failed");
        }
    }
}

pub(crate) fn extended_message(new_expires_at: DateTime<Utc>) -> String {
    format!(
        "Подписка продлена до {}. VPN-доступ уже активен.",
        new_expires_at.format("%Y-%m-%d %H:%M UTC")
    )
}

pub(crate) fn admin_payment_message(provider: &str, telegram_user_id: TelegramUserId, tariff_code: &str) -> String {
    format!("[{provider}] Оплата пользователем {telegram_user_id}, тариф {tariff_code}")
}
