use rust_decimal::Decimal;
use vpnctl_core::{Tariff, VpnctlError};

use crate::db::Store;

impl Store {
    pub async fn get_tariff_by_code(&self, code: &str) -> Result<Option<Tariff>, VpnctlError> {
        let row = sqlx::query_as::<_, TariffRow>(
            r#"
            SELECT code, days, price, points_price, is_active, ref_enabled, ref_base_bonus_points
            FROM tariffs
            WHERE code = $1 AND is_active = TRUE
            "#,
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    /// Same lookup the referral engine uses, kept distinct from
    /// `get_tariff_by_code` because the original separated "is this tariff
    /// payable" from "does this tariff pay referral bonuses" into two
    /// queries even though they hit the same row.
    pub async fn get_tariff_for_referral_by_code(
        &self,
        code: &str,
    ) -> Result<Option<Tariff>, VpnctlError> {
        self.get_tariff_by_code(code).await
    }

    pub async fn list_active_tariffs(&self) -> Result<Vec<Tariff>, VpnctlError> {
        let rows = sqlx::query_as::<_, TariffRow>(
            r#"
            SELECT code, days, price, points_price, is_active, ref_enabled, ref_base_bonus_points
            FROM tariffs
            WHERE is_active = TRUE
            ORDER BY days ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[derive(sqlx::FromRow)]
struct TariffRow {
    code: String,
    days: i32,
    price: Decimal,
    points_price: Option<i64>,
    is_active: bool,
    ref_enabled: bool,
    ref_base_bonus_points: i64,
}

impl From<TariffRow> for Tariff {
    fn from(r: TariffRow) -> Self {
        Tariff {
            code: r.code,
            days: r.days as i64,
            price: r.price,
            points_price: r.points_price,
            is_active: r.is_active,
            ref_enabled: r.ref_enabled,
            ref_base_bonus_points: r.ref_base_bonus_points,
        }
    }
}
