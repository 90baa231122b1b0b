use chrono::{DateTime, Utc};
use vpnctl_core::{PromoCode, PromoTariffScope, TelegramUserId, VpnctlError};

use crate::db::Store;

pub struct PromoRedemption {
    pub new_expires_at: DateTime<Utc>,
    pub usage_id: i64,
}

impl Store {
    pub async fn get_promo_code(&self, code: &str) -> Result<Option<PromoCode>, VpnctlError> {
        let row = sqlx::query_as::<_, PromoRow>(
            r#"
            SELECT id, code, extra_days, is_multi_use, max_uses, per_user_limit, used_count,
                   valid_from, valid_until, tariff_scope, allowed_tariffs, allowed_telegram_id,
                   is_active, comment, created_at, created_by_admin_id
            FROM promo_codes
            WHERE code = $1
            "#,
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    /// Redeems `code` against the latest active subscription for
    /// `telegram_user_id`, extending its expiry by `extra_days`. Validates
    /// the code's validity window, per-user limit, and tariff/telegram-id
    /// restrictions inside the same transaction that locks the row, exactly
    /// mirroring the original's lock-then-validate-then-spend ordering so a
    /// race between two redemptions of a near-exhausted multi-use code
    /// can't double-spend the last slot.
    pub async fn apply_promo_code_to_latest_subscription(
        &self,
        telegram_user_id: TelegramUserId,
        code: &str,
        current_tariff_code: Option<&str>,
    ) -> Result<PromoRedemption, VpnctlError> {
        let mut tx = self.pool.begin().await?;
        let promo = self.lock_and_validate_promo(&mut tx, code, telegram_user_id, current_tariff_code).await?;

        let sub_row: Option<(i64, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT id, expires_at FROM vpn_subscriptions
            WHERE telegram_user_id = $1 AND is_active = TRUE
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(telegram_user_id)
        .fetch_optional(&mut *tx)
        .await?;
        let (subscription_id, old_expires_at) =
            sub_row.ok_or(VpnctlError::NoActiveSubscription(telegram_user_id))?;

        let new_expires_at = old_expires_at.max(Utc::now()) + chrono::Duration::days(promo.extra_days as i64);

        sqlx::query("UPDATE vpn_subscriptions SET expires_at = $2 WHERE id = $1")
            .bind(subscription_id)
            .bind(new_expires_at)
            .execute(&mut *tx)
            .await?;

        let usage_id = self
            .record_promo_usage(&mut tx, promo.id, telegram_user_id, Some(subscription_id))
            .await?;
        self.bump_promo_usage_count(&mut tx, promo.id, promo.max_uses, promo.used_count)
            .await?;

        tx.commit().await?;
        Ok(PromoRedemption {
            new_expires_at,
            usage_id,
        })
    }

    /// Same validation/spend path as
    /// [`apply_promo_code_to_latest_subscription`], for a user with no
    /// active subscription yet. Returns a floating usage id (no
    /// `subscription_id` attached) that the caller links once the new
    /// subscription row is created.
    pub async fn apply_promo_code_without_subscription(
        &self,
        telegram_user_id: TelegramUserId,
        code: &str,
    ) -> Result<(DateTime<Utc>, i64), VpnctlError> {
        let mut tx = self.pool.begin().await?;
        let promo = self.lock_and_validate_promo(&mut tx, code, telegram_user_id, None).await?;

        let new_expires_at = Utc::now() + chrono::Duration::days(promo.extra_days as i64);

        let usage_id = self
            .record_promo_usage(&mut tx, promo.id, telegram_user_id, None)
            .await?;
        self.bump_promo_usage_count(&mut tx, promo.id, promo.max_uses, promo.used_count)
            .await?;

        tx.commit().await?;
        Ok((new_expires_at, usage_id))
    }

    async fn lock_and_validate_promo(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        code: &str,
        telegram_user_id: TelegramUserId,
        current_tariff_code: Option<&str>,
    ) -> Result<PromoCode, VpnctlError> {
        let trimmed = code.trim();
        if trimmed.is_empty() {
            return Err(VpnctlError::PromoNotFoundOrInactive(String::new()));
        }

        let row = sqlx::query_as::<_, PromoRow>(
            r#"
            SELECT id, code, extra_days, is_multi_use, max_uses, per_user_limit, used_count,
                   valid_from, valid_until, tariff_scope, allowed_tariffs, allowed_telegram_id,
                   is_active, comment, created_at, created_by_admin_id
            FROM promo_codes
            WHERE code = $1
              AND is_active = TRUE
              AND (valid_from IS NULL OR valid_from <= NOW())
              AND (valid_until IS NULL OR valid_until >= NOW())
            FOR UPDATE
            "#,
        )
        .bind(trimmed)
        .fetch_optional(&mut **tx)
        .await?;

        let promo: PromoCode = row
            .ok_or_else(|| VpnctlError::PromoNotFoundOrInactive(trimmed.to_string()))?
            .into();

        if promo.extra_days <= 0 {
            return Err(VpnctlError::Other("promo code has invalid_extra_days".into()));
        }

        if let Some(allowed_id) = promo.allowed_telegram_id {
            if allowed_id != telegram_user_id {
                return Err(VpnctlError::PromoTelegramIdMismatch);
            }
        }

        if promo.tariff_scope == PromoTariffScope::Allowlist {
            match current_tariff_code {
                Some(t) if promo.allowed_tariffs.iter().any(|a| a == t) => {}
                _ => return Err(VpnctlError::PromoTariffNotAllowed),
            }
        }

        if let Some(max_uses) = promo.max_uses {
            if promo.used_count >= max_uses {
                return Err(VpnctlError::NoUsesLeft);
            }
        }

        if let Some(limit) = promo.per_user_limit {
            let used_by_user: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM promo_code_usages WHERE promo_code_id = $1 AND telegram_user_id = $2",
            )
            .bind(promo.id)
            .bind(telegram_user_id)
            .fetch_one(&mut **tx)
            .await?;
            if used_by_user >= limit as i64 {
                return Err(VpnctlError::PerUserLimitReached);
            }
        }

        if !promo.is_multi_use {
            let used_by_user: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM promo_code_usages WHERE promo_code_id = $1 AND telegram_user_id = $2",
            )
            .bind(promo.id)
            .bind(telegram_user_id)
            .fetch_one(&mut **tx)
            .await?;
            if used_by_user > 0 {
                return Err(VpnctlError::PerUserLimitReached);
            }
        }

        Ok(promo)
    }

    async fn record_promo_usage(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        promo_code_id: i64,
        telegram_user_id: TelegramUserId,
        subscription_id: Option<i64>,
    ) -> Result<i64, VpnctlError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO promo_code_usages (promo_code_id, telegram_user_id, subscription_id)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(promo_code_id)
        .bind(telegram_user_id)
        .bind(subscription_id)
        .fetch_one(&mut **tx)
        .await?;
        Ok(id)
    }

    async fn bump_promo_usage_count(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        promo_code_id: i64,
        max_uses: Option<i32>,
        used_count_before: i32,
    ) -> Result<(), VpnctlError> {
        let auto_deactivate = max_uses
            .map(|max| used_count_before + 1 >= max)
            .unwrap_or(false);

        sqlx::query(
            r#"
            UPDATE promo_codes
            SET used_count = used_count + 1,
                is_active = CASE WHEN $2 THEN FALSE ELSE is_active END
            WHERE id = $1
            "#,
        )
        .bind(promo_code_id)
        .bind(auto_deactivate)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Links a floating promo-code usage (recorded before the new
    /// subscription row existed) once that subscription has been inserted.
    pub async fn link_promo_usage_to_subscription(
        &self,
        usage_id: i64,
        subscription_id: i64,
    ) -> Result<(), VpnctlError> {
        sqlx::query("UPDATE promo_code_usages SET subscription_id = $2 WHERE id = $1")
            .bind(usage_id)
            .bind(subscription_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Admin-only bulk insert for freshly generated promo codes; see
    /// `vpnctl_core::PromoGenerationParams`. Not reachable from the webhook
    /// or controller path.
    pub async fn insert_promo_codes(&self, codes: &[vpnctl_core::PromoCode]) -> Result<(), VpnctlError> {
        let mut tx = self.pool.begin().await?;
        for c in codes {
            sqlx::query(
                r#"
                INSERT INTO promo_codes (
                    code, extra_days, is_multi_use, max_uses, per_user_limit,
                    valid_from, valid_until, tariff_scope, allowed_tariffs,
                    allowed_telegram_id, is_active, comment, created_by_admin_id
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                "#,
            )
            .bind(&c.code)
            .bind(c.extra_days)
            .bind(c.is_multi_use)
            .bind(c.max_uses)
            .bind(c.per_user_limit)
            .bind(c.valid_from)
            .bind(c.valid_until)
            .bind(match c.tariff_scope {
                PromoTariffScope::Any => "any",
                PromoTariffScope::Allowlist => "allowlist",
            })
            .bind(&c.allowed_tariffs)
            .bind(c.allowed_telegram_id)
            .bind(c.is_active)
            .bind(&c.comment)
            .bind(c.created_by_admin_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct PromoRow {
    id: i64,
    code: String,
    extra_days: i32,
    is_multi_use: bool,
    max_uses: Option<i32>,
    per_user_limit: Option<i32>,
    used_count: i32,
    valid_from: Option<DateTime<Utc>>,
    valid_until: Option<DateTime<Utc>>,
    tariff_scope: String,
    allowed_tariffs: Vec<String>,
    allowed_telegram_id: Option<TelegramUserId>,
    is_active: bool,
    comment: Option<String>,
    created_at: DateTime<Utc>,
    created_by_admin_id: Option<TelegramUserId>,
}

impl From<PromoRow> for PromoCode {
    fn from(r: PromoRow) -> Self {
        PromoCode {
            id: r.id,
            code: r.code,
            extra_days: r.extra_days,
            is_multi_use: r.is_multi_use,
            max_uses: r.max_uses,
            per_user_limit: r.per_user_limit,
            used_count: r.used_count,
            valid_from: r.valid_from,
            valid_until: r.valid_until,
            tariff_scope: if r.tariff_scope == "allowlist" {
                PromoTariffScope::Allowlist
            } else {
                PromoTariffScope::Any
            },
            allowed_tariffs: r.allowed_tariffs,
            allowed_telegram_id: r.allowed_telegram_id,
            is_active: r.is_active,
            comment: r.comment,
            created_at: r.created_at,
            created_by_admin_id: r.created_by_admin_id,
        }
    }
}
