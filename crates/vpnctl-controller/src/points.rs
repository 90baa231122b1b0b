use chrono::Utc;
use vpnctl_core::{PaymentSource, TelegramUserId, VpnctlError};

use crate::engine::{extended_message, Controller};
use crate::Outcome;

impl Controller {
    /// Bot-driven points redemption. Tries the common case first — extend an
    /// existing active subscription — and falls back to reviving the user's
    /// most recent keypair/IP (T-Revive-Reuse) when there is none, so a user
    /// with a lapsed subscription can still pay with points without the bot
    /// resending a config their client already has.
    pub async fn pay_with_points(
        &self,
        telegram_user_id: TelegramUserId,
        tariff_code: &str,
    ) -> Result<Outcome, VpnctlError> {
        let event_name = format!("points_payment_{telegram_user_id}_{}", Utc::now().timestamp_micros());

        match self.store.pay_subscription_with_points(telegram_user_id, tariff_code, &event_name).await {
            Ok((sub, _balance)) => {
                self.notify_user_best_effort(telegram_user_id, &extended_message(sub.expires_at)).await;
                self.apply_referral_rewards_best_effort(telegram_user_id, sub.id, tariff_code, PaymentSource::Points, None)
                    .await;
                Ok(Outcome::Extended { subscription_id: sub.id, new_expires_at: sub.expires_at })
            }
            Err(VpnctlError::NoActiveSubscription(_)) => {
                self.revive_with_points(telegram_user_id, tariff_code, &event_name).await
            }
            Err(e) => Err(e),
        }
    }

    async fn revive_with_points(
        &self,
        telegram_user_id: TelegramUserId,
        tariff_code: &str,
        event_name: &str,
    ) -> Result<Outcome, VpnctlError> {
        let tariff = self
            .store
            .get_tariff_by_code(tariff_code)
            .await?
            .ok_or_else(|| VpnctlError::TariffNotFoundOrInactive(tariff_code.to_string()))?;
        let points_price = tariff
            .points_price
            .ok_or_else(|| VpnctlError::TariffNotFoundOrInactive(tariff_code.to_string()))?;

        let balance = self.store.get_user_points_balance(telegram_user_id).await?;
        if balance < points_price {
            return Err(VpnctlError::InsufficientPoints { need: points_price, have: balance });
        }

        // Charge before provisioning anything: `add_points` takes the balance
        // row lock and re-checks under it, so a concurrent spend racing the
        // check above is still caught here. Debiting first means that check
        // failing can never leave a revived/created subscription unpaid.
        self.store
            .add_points(
                telegram_user_id,
                -points_price,
                "subscription_extend",
                "points",
                None,
                None,
                None,
                None,
                false,
            )
            .await?;

        let prior = self.store.get_latest_subscription_any_state(telegram_user_id).await?;
        let now = Utc::now();
        let expires_at = now + chrono::Duration::days(tariff.days);
        let had_prior_keys = prior.is_some();

        let provisioned = match &prior {
            Some(prior) => self.revive_subscription(prior, telegram_user_id, expires_at, event_name).await,
            None => {
                self.provision_new_subscription(
                    0, 0, 0, 0, &format!("points_{tariff_code}"), "Points", telegram_user_id, expires_at, event_name,
                )
                .await
            }
        };

        let sub = match provisioned {
            Ok(sub) => sub,
            Err(e) => {
                // Provisioning never happened; the charge above must not stick.
                if let Err(refund_err) = self
                    .store
                    .add_points(
                        telegram_user_id,
                        points_price,
                        "subscription_extend_refund",
                        "points",
                        None,
                        None,
                        None,
                        None,
                        true,
                    )
                    .await
                {
                    tracing::error!(error = %refund_err, telegram_user_id, "failed to refund points after provisioning failure");
                }
                return Err(e);
            }
        };

        if had_prior_keys {
            // Client already holds this config from the prior subscription.
            self.notify_user_best_effort(telegram_user_id, &extended_message(expires_at)).await;
        } else {
            let config_text = self.gateway.build_client_config(&sub.client_private_key, &sub.client_ip);
            if let Err(e) = self.notifier.send_vpn_config(telegram_user_id, &config_text, None).await {
                tracing::warn!(error = %e, telegram_user_id, "user unreachable delivering points-purchased config");
            }
        }

        self.apply_referral_rewards_best_effort(telegram_user_id, sub.id, tariff_code, PaymentSource::Points, None)
            .await;

        Ok(Outcome::Revived { subscription_id: sub.id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_name_is_unique_per_call() {
        let a = format!("points_payment_{}_{}", 1, Utc::now().timestamp_micros());
        let b = format!("points_payment_{}_{}", 1, Utc::now().timestamp_micros() + 1);
        assert_ne!(a, b);
    }
}
