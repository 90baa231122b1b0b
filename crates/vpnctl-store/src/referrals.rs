use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::BTreeMap;
use vpnctl_core::{
    PaymentSource, ReferralInfo, ReferralLevel, TelegramUserId, VpnctlError, MAX_REFERRAL_LEVELS,
};

use crate::db::Store;

/// One reward credited to a single upline level while distributing referral
/// bonuses for a paid subscription.
pub struct ReferralAward {
    pub level: i32,
    pub referrer_telegram_user_id: TelegramUserId,
    pub bonus: i64,
}

impl Store {
    pub async fn is_user_referral_blocked(
        &self,
        telegram_user_id: TelegramUserId,
    ) -> Result<bool, VpnctlError> {
        let blocked: Option<bool> = sqlx::query_scalar(
            "SELECT is_referral_blocked FROM user_profiles WHERE telegram_user_id = $1",
        )
        .bind(telegram_user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(blocked.unwrap_or(false))
    }

    pub async fn ensure_user_profile(
        &self,
        telegram_user_id: TelegramUserId,
        telegram_username: Option<&str>,
    ) -> Result<(), VpnctlError> {
        sqlx::query(
            r#"
            INSERT INTO user_profiles (telegram_user_id, telegram_username)
            VALUES ($1, $2)
            ON CONFLICT (telegram_user_id) DO NOTHING
            "#,
        )
        .bind(telegram_user_id)
        .bind(telegram_username)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Walks the referrer chain up to `MAX_REFERRAL_LEVELS` hops, returning
    /// `[level-1 referrer, level-2 referrer, ...]`. Stops as soon as a link
    /// is missing.
    pub async fn get_referral_upline_chain(
        &self,
        referred_telegram_user_id: TelegramUserId,
    ) -> Result<Vec<TelegramUserId>, VpnctlError> {
        let mut chain = Vec::new();
        let mut current = referred_telegram_user_id;

        for _ in 0..MAX_REFERRAL_LEVELS {
            let referrer: Option<TelegramUserId> = sqlx::query_scalar(
                "SELECT referrer_telegram_user_id FROM referrals WHERE referred_telegram_user_id = $1",
            )
            .bind(current)
            .fetch_optional(&self.pool)
            .await?;

            let Some(referrer_id) = referrer else {
                break;
            };
            chain.push(referrer_id);
            current = referrer_id;
        }

        Ok(chain)
    }

    /// Creates the `referred -> referrer` link. One referrer per user,
    /// enforced by the primary key on `referred_telegram_user_id`.
    pub async fn create_referral_link(
        &self,
        referred_telegram_user_id: TelegramUserId,
        referrer_telegram_user_id: TelegramUserId,
    ) -> Result<(), VpnctlError> {
        if referred_telegram_user_id == referrer_telegram_user_id {
            return Err(VpnctlError::SelfReferral);
        }

        let mut tx = self.pool.begin().await?;

        let existing: Option<TelegramUserId> = sqlx::query_scalar(
            "SELECT referrer_telegram_user_id FROM referrals WHERE referred_telegram_user_id = $1 FOR UPDATE",
        )
        .bind(referred_telegram_user_id)
        .fetch_optional(&mut *tx)
        .await?;
        if existing.is_some() {
            tx.rollback().await?;
            return Err(VpnctlError::AlreadyHasReferrer);
        }

        sqlx::query(
            "INSERT INTO referrals (referred_telegram_user_id, referrer_telegram_user_id) VALUES ($1, $2)",
        )
        .bind(referred_telegram_user_id)
        .bind(referrer_telegram_user_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_referral_code_owner(
        &self,
        code: &str,
    ) -> Result<Option<TelegramUserId>, VpnctlError> {
        let code = code.trim();
        if code.is_empty() {
            return Ok(None);
        }
        let owner: Option<TelegramUserId> = sqlx::query_scalar(
            "SELECT referrer_telegram_user_id FROM referral_codes WHERE code = $1 AND is_active = TRUE",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(owner)
    }

    /// Deep-link `/start <code>` entry point: resolves the code, rejects
    /// self-referrals, and records the link. Failures (unknown code,
    /// self-ref, already-linked) are returned as typed errors rather than
    /// panicking — the caller (bot command handler) degrades gracefully.
    pub async fn register_referral_start(
        &self,
        invited_telegram_user_id: TelegramUserId,
        referral_code: &str,
    ) -> Result<TelegramUserId, VpnctlError> {
        let referrer_id = self
            .get_referral_code_owner(referral_code)
            .await?
            .ok_or_else(|| VpnctlError::Other("referral code not found or inactive".into()))?;

        self.create_referral_link(invited_telegram_user_id, referrer_id)
            .await?;
        Ok(referrer_id)
    }

    /// Existing active code for `referrer_telegram_user_id`, or mints
    /// `REF<telegram_id>` (with a numeric suffix on a rare collision).
    pub async fn create_or_get_referral_code(
        &self,
        referrer_telegram_user_id: TelegramUserId,
    ) -> Result<String, VpnctlError> {
        let existing: Option<String> = sqlx::query_scalar(
            r#"
            SELECT code FROM referral_codes
            WHERE referrer_telegram_user_id = $1 AND is_active = TRUE
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(referrer_telegram_user_id)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(code) = existing {
            return Ok(code);
        }

        let base_code = format!("REF{referrer_telegram_user_id}");
        let mut candidate = base_code.clone();
        let mut attempt = 0u32;

        loop {
            let inserted: Result<(String,), sqlx::Error> = sqlx::query_as(
                r#"
                INSERT INTO referral_codes (code, referrer_telegram_user_id, is_active)
                VALUES ($1, $2, TRUE)
                RETURNING code
                "#,
            )
            .bind(&candidate)
            .bind(referrer_telegram_user_id)
            .fetch_one(&self.pool)
            .await;

            match inserted {
                Ok((code,)) => return Ok(code),
                Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                    attempt += 1;
                    candidate = format!("{base_code}_{attempt}");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub async fn get_referral_levels(&self) -> Result<BTreeMap<i32, ReferralLevel>, VpnctlError> {
        let rows: Vec<(i32, Decimal, bool)> =
            sqlx::query_as("SELECT level, multiplier, is_active FROM referral_levels")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(level, multiplier, is_active)| {
                (
                    level,
                    ReferralLevel {
                        level,
                        multiplier,
                        is_active,
                    },
                )
            })
            .collect())
    }

    /// Distributes referral reward points for a subscription payment up the
    /// upline chain. A no-op (not an error) if the payer is blocked, the
    /// tariff doesn't pay referral bonuses, or there's no upline.
    pub async fn apply_referral_rewards_for_subscription(
        &self,
        payer_telegram_user_id: TelegramUserId,
        subscription_id: i64,
        tariff_code: &str,
        payment_source: PaymentSource,
        payment_id: Option<&str>,
    ) -> Result<Vec<ReferralAward>, VpnctlError> {
        if self.is_user_referral_blocked(payer_telegram_user_id).await? {
            return Ok(Vec::new());
        }

        let Some(tariff) = self.get_tariff_for_referral_by_code(tariff_code).await? else {
            return Ok(Vec::new());
        };
        if !tariff.ref_enabled || tariff.ref_base_bonus_points <= 0 {
            return Ok(Vec::new());
        }

        let upline = self
            .get_referral_upline_chain(payer_telegram_user_id)
            .await?;
        if upline.is_empty() {
            return Ok(Vec::new());
        }

        let levels = self.get_referral_levels().await?;
        if levels.is_empty() {
            return Ok(Vec::new());
        }

        let mut awards = Vec::new();
        for (idx, referrer_id) in upline.into_iter().enumerate() {
            let level_num = (idx + 1) as i32;
            let Some(level_cfg) = levels.get(&level_num) else {
                continue;
            };
            if !level_cfg.is_active {
                continue;
            }
            if level_cfg.multiplier <= Decimal::ZERO {
                continue;
            }

            let bonus_raw = Decimal::from(tariff.ref_base_bonus_points) * level_cfg.multiplier;
            let bonus = bonus_raw.round().to_i64().unwrap_or(0);
            if bonus <= 0 {
                continue;
            }

            let meta = json!({
                "tariff_code": tariff_code,
                "payer_telegram_user_id": payer_telegram_user_id,
            });

            self.add_points(
                referrer_id,
                bonus,
                &format!("ref_level_{level_num}"),
                &payment_source.to_string(),
                Some(subscription_id),
                payment_id,
                Some(level_num),
                Some(meta),
                false,
            )
            .await?;

            awards.push(ReferralAward {
                level: level_num,
                referrer_telegram_user_id: referrer_id,
                bonus,
            });
        }

        Ok(awards)
    }

    /// `/ref` command data: the user's own code, first-level invite/paid
    /// counts, and a per-level downline breakdown out to 5 levels.
    pub async fn get_or_create_referral_info(
        &self,
        telegram_user_id: TelegramUserId,
        telegram_username: Option<&str>,
    ) -> Result<ReferralInfo, VpnctlError> {
        self.ensure_user_profile(telegram_user_id, telegram_username)
            .await?;
        let ref_code = self.create_or_get_referral_code(telegram_user_id).await?;

        let mut invited_by_levels = BTreeMap::new();
        let mut paid_by_levels = BTreeMap::new();

        // BFS down the referral tree level by level, same bound as the
        // upline walk so a downline can never grow deeper than an upline
        // could credit it.
        let mut frontier = vec![telegram_user_id];
        for level in 1..=MAX_REFERRAL_LEVELS as i32 {
            if frontier.is_empty() {
                break;
            }
            let mut next_frontier = Vec::new();
            let mut invited = 0i64;
            let mut paid = 0i64;

            for referrer in &frontier {
                let invitees: Vec<TelegramUserId> = sqlx::query_scalar(
                    "SELECT referred_telegram_user_id FROM referrals WHERE referrer_telegram_user_id = $1",
                )
                .bind(referrer)
                .fetch_all(&self.pool)
                .await?;

                for invitee in invitees {
                    invited += 1;
                    // "Paid" means a row whose last_event_name marks a
                    // successful payment from one of the three provider
                    // surfaces — not merely having any subscription row
                    // (which free trials/promo/points redemptions also
                    // produce).
                    let has_paid: Option<i64> = sqlx::query_scalar(
                        r#"
                        SELECT id FROM vpn_subscriptions
                        WHERE telegram_user_id = $1
                          AND (
                              last_event_name LIKE 'yookassa_payment_succeeded_%'
                              OR last_event_name LIKE 'heleket_payment_paid_%'
                              OR last_event_name IN ('new_subscription', 'new_donation')
                          )
                        LIMIT 1
                        "#,
                    )
                    .bind(invitee)
                    .fetch_optional(&self.pool)
                    .await?;
                    if has_paid.is_some() {
                        paid += 1;
                    }
                    next_frontier.push(invitee);
                }
            }

            if invited > 0 {
                invited_by_levels.insert(level, invited);
                paid_by_levels.insert(level, paid);
            }
            frontier = next_frontier;
        }

        let invited_count = invited_by_levels.get(&1).copied().unwrap_or(0);
        let paid_referrals_count = paid_by_levels.get(&1).copied().unwrap_or(0);

        Ok(ReferralInfo {
            ref_code,
            invited_count,
            paid_referrals_count,
            invited_by_levels,
            paid_by_levels,
        })
    }
}
