use chrono::{DateTime, Utc};
use vpnctl_core::{Subscription, TelegramUserId, VpnctlError};

use crate::db::Store;
use crate::ip_lock::IpAllocGuard;

impl Store {
    /// Idempotency gate: has this provider event already been applied?
    pub async fn event_already_processed(&self, event_name: &str) -> Result<bool, VpnctlError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM vpn_subscriptions WHERE last_event_name = $1")
                .bind(event_name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    /// True if `ip` is already bound to an active subscription. Used by the
    /// address allocator to skip taken addresses; takes the allocation
    /// guard's connection so it participates in the same advisory-locked
    /// session as the caller's scan.
    pub async fn is_vpn_ip_used(
        &self,
        guard: &mut IpAllocGuard,
        ip: &str,
    ) -> Result<bool, VpnctlError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM vpn_subscriptions WHERE client_ip = $1 AND is_active = TRUE",
        )
        .bind(ip)
        .fetch_optional(&mut *guard.connection())
        .await?;
        Ok(row.is_some())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_subscription(
        &self,
        tribute_user_id: i64,
        subscription_id: i64,
        period_id: i64,
        channel_id: i64,
        period: &str,
        channel_name: &str,
        telegram_user_id: TelegramUserId,
        client_private_key: &str,
        client_public_key: &str,
        client_ip: &str,
        expires_at: DateTime<Utc>,
        event_name: &str,
    ) -> Result<Subscription, VpnctlError> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            INSERT INTO vpn_subscriptions (
                tribute_user_id, subscription_id, period_id, channel_id,
                period, channel_name, telegram_user_id,
                client_private_key, client_public_key, client_ip,
                is_active, expires_at, last_event_name
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, TRUE, $11, $12)
            RETURNING id, tribute_user_id, subscription_id, period_id, channel_id,
                      period, channel_name, telegram_user_id, client_private_key,
                      client_public_key, client_ip, is_active, expires_at, created_at,
                      last_event_name
            "#,
        )
        .bind(tribute_user_id)
        .bind(subscription_id)
        .bind(period_id)
        .bind(channel_id)
        .bind(period)
        .bind(channel_name)
        .bind(telegram_user_id)
        .bind(client_private_key)
        .bind(client_public_key)
        .bind(client_ip)
        .bind(expires_at)
        .bind(event_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    pub async fn update_subscription_expiration(
        &self,
        subscription_id: i64,
        new_expires_at: DateTime<Utc>,
        event_name: &str,
    ) -> Result<Subscription, VpnctlError> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
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
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    /// Conditional update: flips the row to inactive only if it is
    /// currently active, tagging the transition with `event_name`, and
    /// returns the updated row so the caller can read the public key/IP it
    /// needs to tear down the matching gateway peer. Returns `None` if the
    /// row was already inactive — idempotent under retried deactivations.
    pub async fn deactivate_subscription_by_id(
        &self,
        id: i64,
        event_name: &str,
    ) -> Result<Option<Subscription>, VpnctlError> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            UPDATE vpn_subscriptions
            SET is_active = FALSE, last_event_name = $2
            WHERE id = $1 AND is_active = TRUE
            RETURNING id, tribute_user_id, subscription_id, period_id, channel_id,
                      period, channel_name, telegram_user_id, client_private_key,
                      client_public_key, client_ip, is_active, expires_at,
                      created_at, last_event_name
            "#,
        )
        .bind(id)
        .bind(event_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    /// Symmetric to [`deactivate_subscription_by_id`]: conditional
    /// reactivation, idempotent, returns the row on success.
    pub async fn activate_subscription_by_id(
        &self,
        id: i64,
        event_name: &str,
    ) -> Result<Option<Subscription>, VpnctlError> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            UPDATE vpn_subscriptions
            SET is_active = TRUE, last_event_name = $2
            WHERE id = $1 AND is_active = FALSE
            RETURNING id, tribute_user_id, subscription_id, period_id, channel_id,
                      period, channel_name, telegram_user_id, client_private_key,
                      client_public_key, client_ip, is_active, expires_at, created_at,
                      last_event_name
            "#,
        )
        .bind(id)
        .bind(event_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    /// Looks up the row whose `last_event_name` matches exactly, used by
    /// refund handling to locate the subscription a prior successful
    /// payment created.
    pub async fn get_subscription_by_event(
        &self,
        event_name: &str,
    ) -> Result<Option<Subscription>, VpnctlError> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT id, tribute_user_id, subscription_id, period_id, channel_id,
                   period, channel_name, telegram_user_id, client_private_key,
                   client_public_key, client_ip, is_active, expires_at, created_at,
                   last_event_name
            FROM vpn_subscriptions
            WHERE last_event_name = $1
            "#,
        )
        .bind(event_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    pub async fn get_subscription_by_id(
        &self,
        id: i64,
    ) -> Result<Option<Subscription>, VpnctlError> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT id, tribute_user_id, subscription_id, period_id, channel_id,
                   period, channel_name, telegram_user_id, client_private_key,
                   client_public_key, client_ip, is_active, expires_at, created_at,
                   last_event_name
            FROM vpn_subscriptions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    /// Most recent subscription row for a user regardless of active state,
    /// used by the revive-reuse path to find a keypair/IP worth recycling.
    pub async fn get_latest_subscription_any_state(
        &self,
        telegram_user_id: TelegramUserId,
    ) -> Result<Option<Subscription>, VpnctlError> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT id, tribute_user_id, subscription_id, period_id, channel_id,
                   period, channel_name, telegram_user_id, client_private_key,
                   client_public_key, client_ip, is_active, expires_at, created_at,
                   last_event_name
            FROM vpn_subscriptions
            WHERE telegram_user_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(telegram_user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    /// Admin-only hard delete. Best-effort nulls out referencing rows in
    /// `user_points_transactions`/`promo_code_usages` first so the delete
    /// never fails on a foreign key it doesn't itself enforce via cascade.
    pub async fn delete_subscription_by_id(&self, id: i64) -> Result<bool, VpnctlError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE user_points_transactions SET related_subscription_id = NULL WHERE related_subscription_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE promo_code_usages SET subscription_id = NULL WHERE subscription_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM subscription_notifications WHERE subscription_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM vpn_subscriptions WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// Last 50 subscriptions for the admin listing endpoint.
    pub async fn list_recent_subscriptions(&self, limit: i64) -> Result<Vec<Subscription>, VpnctlError> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT id, tribute_user_id, subscription_id, period_id, channel_id,
                   period, channel_name, telegram_user_id, client_private_key,
                   client_public_key, client_ip, is_active, expires_at, created_at,
                   last_event_name
            FROM vpn_subscriptions
            ORDER BY id DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Legacy (Source C) bulk deactivation keyed by the correlation triple a
    /// `cancelled_subscription` event carries instead of our own row id.
    /// Returns the deactivated rows (plural — a period/channel pair can have
    /// produced more than one over time) so the caller can tear down each
    /// one's gateway peer.
    pub async fn deactivate_subscriptions_for_period(
        &self,
        tribute_user_id: i64,
        period_id: i64,
        channel_id: i64,
        event_name: &str,
    ) -> Result<Vec<Subscription>, VpnctlError> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            UPDATE vpn_subscriptions
            SET is_active = FALSE, last_event_name = $4
            WHERE tribute_user_id = $1 AND period_id = $2 AND channel_id = $3 AND is_active = TRUE
            RETURNING id, tribute_user_id, subscription_id, period_id, channel_id,
                      period, channel_name, telegram_user_id, client_private_key,
                      client_public_key, client_ip, is_active, expires_at, created_at,
                      last_event_name
            "#,
        )
        .bind(tribute_user_id)
        .bind(period_id)
        .bind(channel_id)
        .bind(event_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Active subscription for the legacy correlation triple
    /// `(tribute_user_id, period_id, channel_id)`, used by `new_subscription`
    /// to decide T-Extend vs T-Create.
    pub async fn get_active_subscription_for_period(
        &self,
        tribute_user_id: i64,
        period_id: i64,
        channel_id: i64,
    ) -> Result<Option<Subscription>, VpnctlError> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT id, tribute_user_id, subscription_id, period_id, channel_id,
                   period, channel_name, telegram_user_id, client_private_key,
                   client_public_key, client_ip, is_active, expires_at, created_at,
                   last_event_name
            FROM vpn_subscriptions
            WHERE tribute_user_id = $1 AND period_id = $2 AND channel_id = $3 AND is_active = TRUE
            "#,
        )
        .bind(tribute_user_id)
        .bind(period_id)
        .bind(channel_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    /// Legacy (Source C) donation idempotency lookup: keyed on
    /// `(tribute_user_id, subscription_id)` rather than a single
    /// `last_event_name` string, since the provider supplies no stable
    /// unique donation id separate from the request id.
    pub async fn get_subscription_by_tribute_and_subscription_id(
        &self,
        tribute_user_id: i64,
        subscription_id: i64,
    ) -> Result<Option<Subscription>, VpnctlError> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT id, tribute_user_id, subscription_id, period_id, channel_id,
                   period, channel_name, telegram_user_id, client_private_key,
                   client_public_key, client_ip, is_active, expires_at, created_at,
                   last_event_name
            FROM vpn_subscriptions
            WHERE tribute_user_id = $1 AND subscription_id = $2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(tribute_user_id)
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    pub async fn deactivate_existing_active_subscriptions(
        &self,
        telegram_user_id: TelegramUserId,
    ) -> Result<u64, VpnctlError> {
        let result = sqlx::query(
            "UPDATE vpn_subscriptions SET is_active = FALSE WHERE telegram_user_id = $1 AND is_active = TRUE",
        )
        .bind(telegram_user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn get_active_subscriptions_for_telegram(
        &self,
        telegram_user_id: TelegramUserId,
    ) -> Result<Vec<Subscription>, VpnctlError> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT id, tribute_user_id, subscription_id, period_id, channel_id,
                   period, channel_name, telegram_user_id, client_private_key,
                   client_public_key, client_ip, is_active, expires_at, created_at,
                   last_event_name
            FROM vpn_subscriptions
            WHERE telegram_user_id = $1 AND is_active = TRUE
            ORDER BY created_at DESC
            "#,
        )
        .bind(telegram_user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Most recent active subscription for a user across all channels,
    /// regardless of which provider created it. Used for the crypto
    /// provider's extend-any-active fallback and for promo-code redemption
    /// against "the latest subscription".
    pub async fn get_latest_active_subscription(
        &self,
        telegram_user_id: TelegramUserId,
    ) -> Result<Option<Subscription>, VpnctlError> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT id, tribute_user_id, subscription_id, period_id, channel_id,
                   period, channel_name, telegram_user_id, client_private_key,
                   client_public_key, client_ip, is_active, expires_at, created_at,
                   last_event_name
            FROM vpn_subscriptions
            WHERE telegram_user_id = $1 AND is_active = TRUE
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(telegram_user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    /// Active subscription for `telegram_user_id` created by a specific
    /// channel (e.g. `"Heleket"`, or legacy periods prefixed `"heleket_"`).
    pub async fn get_active_subscription_by_channel(
        &self,
        telegram_user_id: TelegramUserId,
        channel_name: &str,
        period_prefix: &str,
    ) -> Result<Option<Subscription>, VpnctlError> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT id, tribute_user_id, subscription_id, period_id, channel_id,
                   period, channel_name, telegram_user_id, client_private_key,
                   client_public_key, client_ip, is_active, expires_at, created_at,
                   last_event_name
            FROM vpn_subscriptions
            WHERE telegram_user_id = $1
              AND is_active = TRUE
              AND (channel_name = $2 OR period LIKE $3 || '%')
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(telegram_user_id)
        .bind(channel_name)
        .bind(period_prefix)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    /// Active subscriptions whose `expires_at` has already passed; the
    /// expiry worker deactivates each and tears down its gateway peer.
    pub async fn get_expired_active_subscriptions(&self) -> Result<Vec<Subscription>, VpnctlError> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT id, tribute_user_id, subscription_id, period_id, channel_id,
                   period, channel_name, telegram_user_id, client_private_key,
                   client_public_key, client_ip, is_active, expires_at, created_at,
                   last_event_name
            FROM vpn_subscriptions
            WHERE is_active = TRUE AND expires_at <= NOW()
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Active subscriptions whose `expires_at` falls in the half-open
    /// window `(NOW() + min_hours, NOW() + max_hours]` and have not yet
    /// received a `notification_type` reminder. Backs the reminder worker's
    /// three fixed windows: roughly (60h,73h], (12h,25h], (1h,2h], for
    /// `expires_3d`/`expires_1d`/`expires_1h` respectively.
    pub async fn get_subscriptions_needing_reminder(
        &self,
        min_hours: i64,
        max_hours: i64,
        notification_type: &str,
    ) -> Result<Vec<Subscription>, VpnctlError> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT s.id, s.tribute_user_id, s.subscription_id, s.period_id, s.channel_id,
                   s.period, s.channel_name, s.telegram_user_id, s.client_private_key,
                   s.client_public_key, s.client_ip, s.is_active, s.expires_at, s.created_at,
                   s.last_event_name
            FROM vpn_subscriptions s
            WHERE s.is_active = TRUE
              AND s.expires_at <= NOW() + ($2 || ' hours')::interval
              AND s.expires_at > NOW() + ($1 || ' hours')::interval
              AND NOT EXISTS (
                  SELECT 1 FROM subscription_notifications n
                  WHERE n.subscription_id = s.id AND n.notification_type = $3
              )
            "#,
        )
        .bind(min_hours.to_string())
        .bind(max_hours.to_string())
        .bind(notification_type)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Records that `notification_type` was delivered for `subscription_id`,
    /// snapshotting the `telegram_user_id`/`expires_at` it was sent against
    /// so the two uniqueness constraints (per subscription, per user+window)
    /// both gate correctly even across worker restarts.
    pub async fn record_notification_sent(
        &self,
        subscription_id: i64,
        telegram_user_id: TelegramUserId,
        expires_at: DateTime<Utc>,
        notification_type: &str,
    ) -> Result<(), VpnctlError> {
        sqlx::query(
            r#"
            INSERT INTO subscription_notifications
                (subscription_id, notification_type, telegram_user_id, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(subscription_id)
        .bind(notification_type)
        .bind(telegram_user_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct SubscriptionRow {
    id: i64,
    tribute_user_id: i64,
    subscription_id: i64,
    period_id: i64,
    channel_id: i64,
    period: String,
    channel_name: String,
    telegram_user_id: i64,
    client_private_key: String,
    client_public_key: String,
    client_ip: String,
    is_active: bool,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    last_event_name: Option<String>,
}

impl From<SubscriptionRow> for Subscription {
    fn from(r: SubscriptionRow) -> Self {
        Subscription {
            id: r.id,
            tribute_user_id: r.tribute_user_id,
            subscription_id: r.subscription_id,
            period_id: r.period_id,
            channel_id: r.channel_id,
            period: r.period,
            channel_name: r.channel_name,
            telegram_user_id: r.telegram_user_id,
            client_private_key: r.client_private_key,
            client_public_key: r.client_public_key,
            client_ip: r.client_ip,
            is_active: r.is_active,
            expires_at: r.expires_at,
            created_at: r.created_at,
            last_event_name: r.last_event_name,
        }
    }
}
