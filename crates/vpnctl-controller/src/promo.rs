use vpnctl_core::{PaymentSource, TelegramUserId, VpnctlError};

use crate::engine::{extended_message, Controller};
use crate::Outcome;

impl Controller {
    /// Bot-driven promo-code redemption. Same two-path shape as
    /// [`Controller::pay_with_points`]: extend the latest active
    /// subscription when one exists, otherwise revive the user's most
    /// recent keypair/IP and link the already-recorded usage row to it.
    pub async fn redeem_promo(
        &self,
        telegram_user_id: TelegramUserId,
        code: &str,
        current_tariff_code: Option<&str>,
    ) -> Result<Outcome, VpnctlError> {
        let existing_id = self
            .store
            .get_latest_active_subscription(telegram_user_id)
            .await?
            .map(|s| s.id);

        match self
            .store
            .apply_promo_code_to_latest_subscription(telegram_user_id, code, current_tariff_code)
            .await
        {
            Ok(redemption) => {
                self.notify_user_best_effort(telegram_user_id, &extended_message(redemption.new_expires_at)).await;
                Ok(Outcome::Extended {
                    subscription_id: existing_id.unwrap_or_default(),
                    new_expires_at: redemption.new_expires_at,
                })
            }
            Err(VpnctlError::NoActiveSubscription(_)) => self.redeem_promo_without_subscription(telegram_user_id, code).await,
            Err(e) => Err(e),
        }
    }

    async fn redeem_promo_without_subscription(
        &self,
        telegram_user_id: TelegramUserId,
        code: &str,
    ) -> Result<Outcome, VpnctlError> {
        let (new_expires_at, usage_id) = self
            .store
            .apply_promo_code_without_subscription(telegram_user_id, code)
            .await?;

        let prior = self.store.get_latest_subscription_any_state(telegram_user_id).await?;
        let had_prior_keys = prior.is_some();
        let event_name = format!("promo_redeem_{code}_{usage_id}");

        let sub = match prior {
            Some(prior) => self.revive_subscription(&prior, telegram_user_id, new_expires_at, &event_name).await?,
            None => {
                self.provision_new_subscription(
                    0, 0, 0, 0, &format!("promo_{code}"), "Promo", telegram_user_id, new_expires_at, &event_name,
                )
                .await?
            }
        };

        self.store.link_promo_usage_to_subscription(usage_id, sub.id).await?;

        if had_prior_keys {
            self.notify_user_best_effort(telegram_user_id, &extended_message(new_expires_at)).await;
        } else {
            let config_text = self.gateway.build_client_config(&sub.client_private_key, &sub.client_ip);
            if let Err(e) = self.notifier.send_vpn_config(telegram_user_id, &config_text, None).await {
                tracing::warn!(error = %e, telegram_user_id, "user unreachable delivering promo-redeemed config");
            }
        }

        self.apply_referral_rewards_best_effort(telegram_user_id, sub.id, code, PaymentSource::Promo, None)
            .await;

        Ok(Outcome::Revived { subscription_id: sub.id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_name_embeds_code_and_usage_id() {
        let name = format!("promo_redeem_{}_{}", "SPRING25", 42);
        assert_eq!(name, "promo_redeem_SPRING25_42");
    }
}
