use std::sync::Arc;

use vpnctl_core::{PaymentSource, ReferralInfo, TelegramUserId, VpnctlError};
use vpnctl_store::Store;

/// Orchestrates the points/referral subsystem on top of [`Store`]. Thin by
/// design — almost every operation here is one validated store call; the
/// value this layer adds is giving the controller a single entry point that
/// doesn't need to know the store's transaction internals.
#[derive(Clone)]
pub struct PointsEngine {
    store: Arc<Store>,
}

impl PointsEngine {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Distributes referral reward points up to five levels up the upline
    /// chain for a subscription payment. Returns the awards actually
    /// credited; an empty vec is a valid, non-error outcome (blocked payer,
    /// non-referral tariff, no upline, etc. — see
    /// [`vpnctl_store::referrals`]).
    pub async fn apply_referral_rewards(
        &self,
        payer_telegram_user_id: TelegramUserId,
        subscription_id: i64,
        tariff_code: &str,
        payment_source: PaymentSource,
        payment_id: Option<&str>,
    ) -> Result<Vec<vpnctl_store::ReferralAward>, VpnctlError> {
        let awards = self
            .store
            .apply_referral_rewards_for_subscription(
                payer_telegram_user_id,
                subscription_id,
                tariff_code,
                payment_source,
                payment_id,
            )
            .await?;

        for award in &awards {
            tracing::info!(
                referrer = award.referrer_telegram_user_id,
                level = award.level,
                bonus = award.bonus,
                payer = payer_telegram_user_id,
                "credited referral reward"
            );
        }

        Ok(awards)
    }

    /// Deep-link `/start <code>` entry point.
    pub async fn register_referral_start(
        &self,
        invited_telegram_user_id: TelegramUserId,
        referral_code: &str,
    ) -> Result<TelegramUserId, VpnctlError> {
        self.store
            .register_referral_start(invited_telegram_user_id, referral_code)
            .await
    }

    /// `/ref` command data.
    pub async fn get_or_create_referral_info(
        &self,
        telegram_user_id: TelegramUserId,
        telegram_username: Option<&str>,
    ) -> Result<ReferralInfo, VpnctlError> {
        self.store
            .get_or_create_referral_info(telegram_user_id, telegram_username)
            .await
    }

    pub async fn get_balance(&self, telegram_user_id: TelegramUserId) -> Result<i64, VpnctlError> {
        self.store.get_user_points_balance(telegram_user_id).await
    }
}
