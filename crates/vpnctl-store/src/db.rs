use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use vpnctl_core::VpnctlError;

/// Owns the connection pool and exposes one method per storage operation:
/// subscriptions, points, referrals, promo codes and tariffs each get their
/// own `impl Store` block in a sibling module rather than a separate type.
#[derive(Clone)]
pub struct Store {
    pub(crate) pool: PgPool,
    pub(crate) ip_alloc_lock_id: i64,
}

impl Store {
    /// `min_connections`/`max_connections` come from `DB_POOL_MIN`/
    /// `DB_POOL_MAX`; `ip_alloc_lock_id` from `DB_IP_ALLOC_LOCK_ID`, the
    /// advisory-lock key the IP allocator serializes on.
    pub async fn connect(
        database_url: &str,
        min_connections: u32,
        max_connections: u32,
        ip_alloc_lock_id: i64,
    ) -> Result<Self, VpnctlError> {
        let pool = PgPoolOptions::new()
            .min_connections(min_connections)
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool, ip_alloc_lock_id })
    }

    pub async fn migrate(&self) -> Result<(), VpnctlError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| VpnctlError::Migration(e.to_string()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
