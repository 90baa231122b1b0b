use chrono::{DateTime, Utc};
use serde_json::Value as Json;
use vpnctl_core::{Subscription, TelegramUserId, VpnctlError};

use crate::db::Store;

/// Outcome of [`Store::add_points`]: either the new balance, or a specific
/// reason the mutation was refused.
pub struct AddPointsResult {
    pub balance: i64,
}

impl Store {
    /// Universal points-balance mutation point. `delta > 0` credits,
    /// `delta < 0` debits. Refuses to go negative unless `allow_negative`.
    #[allow(clippy::too_many_arguments)]
    pub async fn add_points(
        &self,
        telegram_user_id: TelegramUserId,
        delta: i64,
        reason: &str,
        source: &str,
        related_subscription_id: Option<i64>,
        related_payment_id: Option<&str>,
        level: Option<i32>,
        meta: Option<Json>,
        allow_negative: bool,
    ) -> Result<AddPointsResult, VpnctlError> {
        if delta == 0 {
            return Err(VpnctlError::ZeroPointsDelta);
        }

        let mut tx = self.pool.begin().await?;

        let old_balance: i64 = sqlx::query_scalar(
            "SELECT balance FROM user_points WHERE telegram_user_id = $1 FOR UPDATE",
        )
        .bind(telegram_user_id)
        .fetch_optional(&mut *tx)
        .await?
        .unwrap_or(0);

        let new_balance = old_balance + delta;
        if !allow_negative && new_balance < 0 {
            tx.rollback().await?;
            return Err(VpnctlError::InsufficientFunds);
        }

        let final_balance: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO user_points (telegram_user_id, balance, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (telegram_user_id) DO UPDATE
            SET balance = EXCLUDED.balance, updated_at = NOW()
            RETURNING balance
            "#,
        )
        .bind(telegram_user_id)
        .bind(new_balance)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO user_points_transactions (
                telegram_user_id, delta, reason, source,
                related_subscription_id, related_payment_id, level, meta
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(telegram_user_id)
        .bind(delta)
        .bind(reason)
        .bind(source)
        .bind(related_subscription_id)
        .bind(related_payment_id)
        .bind(level)
        .bind(meta)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(AddPointsResult {
            balance: final_balance,
        })
    }

    pub async fn get_user_points_balance(
        &self,
        telegram_user_id: TelegramUserId,
    ) -> Result<i64, VpnctlError> {
        let balance: Option<i64> =
            sqlx::query_scalar("SELECT balance FROM user_points WHERE telegram_user_id = $1")
                .bind(telegram_user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(balance.unwrap_or(0))
    }

    /// Redeems a points balance against the latest active subscription for
    /// `tariff_code`, extending its expiry by the tariff's day count. Locks
    /// the subscription and balance rows in a fixed order (subscription,
    /// then points) to match the original's transaction and avoid
    /// deadlocking against concurrent `add_points` calls that only touch
    /// the points row.
    pub async fn pay_subscription_with_points(
        &self,
        telegram_user_id: TelegramUserId,
        tariff_code: &str,
        event_name: &str,
    ) -> Result<(Subscription, i64), VpnctlError> {
        let mut tx = self.pool.begin().await?;

        let (days, points_price): (i32, i64) = sqlx::query_as(
            "SELECT days, COALESCE(points_price, 0) FROM tariffs WHERE code = $1 AND is_active = TRUE",
        )
        .bind(tariff_code)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| VpnctlError::TariffNotFoundOrInactive(tariff_code.to_string()))?;

        let sub_row: Option<(i64, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT id, expires_at FROM vpn_subscriptions
            WHERE telegram_user_id = $1 AND is_active = TRUE
            ORDER BY created_at DESC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(telegram_user_id)
        .fetch_optional(&mut *tx)
        .await?;
        let (subscription_id, old_expires_at) =
            sub_row.ok_or(VpnctlError::NoActiveSubscription(telegram_user_id))?;

        let balance: i64 = sqlx::query_scalar(
            "SELECT balance FROM user_points WHERE telegram_user_id = $1 FOR UPDATE",
        )
        .bind(telegram_user_id)
        .fetch_optional(&mut *tx)
        .await?
        .unwrap_or(0);

        if balance < points_price {
            tx.rollback().await?;
            return Err(VpnctlError::InsufficientPoints {
                need: points_price,
                have: balance,
            });
        }

        let new_balance = balance - points_price;
        sqlx::query(
            r#"
            INSERT INTO user_points (telegram_user_id, balance, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (telegram_user_id) DO UPDATE
            SET balance = EXCLUDED.balance, updated_at = NOW()
            "#,
        )
        .bind(telegram_user_id)
        .bind(new_balance)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO user_points_transactions (
                telegram_user_id, delta, reason, source, related_subscription_id
            )
            VALUES ($1, $2, 'subscription_extend', 'points', $3)
            "#,
        )
        .bind(telegram_user_id)
        .bind(-points_price)
        .bind(subscription_id)
        .execute(&mut *tx)
        .await?;

        let base = old_expires_at.max(Utc::now());
        let new_expires_at = base + chrono::Duration::days(days as i64);

        let updated = sqlx::query_as::<_, crate::subscriptions::SubscriptionRow>(
            r#"
            UPDATE vpn_subscriptions
            SET expires_at = $2, last_event_name = $3
            WHERE id = $1
            RETURNING id, tribute_user_id, subscription_id, period_id, channel_id,
                      period, channel_name, telegram_user_id, client_private_key,
                      client_public_key, client_ip, is_active, expires_at, created_at,
                      last_event_name
            "#,
        )
        .bind(subscription_id)
        .bind(new_expires_at)
        .bind(event_name)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((updated.into(), new_balance))
    }
}
