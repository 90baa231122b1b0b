use sqlx::pool::PoolConnection;
use sqlx::Postgres;
use vpnctl_core::VpnctlError;

use crate::db::Store;

/// A held Postgres session-level advisory lock, scoped to one connection
/// checked out of the pool.
///
/// Rust has no implicit task-local re-entrant lock state, so the critical
/// section is modeled as an explicit handle instead: callers acquire it
/// once, thread `&mut IpAllocGuard` through every [`Store`] method that
/// needs to participate in the critical section, and drop it (or call
/// [`IpAllocGuard::release`]) when done.
pub struct IpAllocGuard {
    conn: PoolConnection<Postgres>,
    lock_id: i64,
    released: bool,
}

impl Store {
    /// Acquires the IP allocation advisory lock (keyed by `DB_IP_ALLOC_LOCK_ID`),
    /// blocking until free.
    pub async fn acquire_ip_alloc_lock(&self) -> Result<IpAllocGuard, VpnctlError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(self.ip_alloc_lock_id)
            .execute(&mut *conn)
            .await?;
        Ok(IpAllocGuard {
            conn,
            lock_id: self.ip_alloc_lock_id,
            released: false,
        })
    }
}

impl IpAllocGuard {
    pub fn connection(&mut self) -> &mut PoolConnection<Postgres> {
        &mut self.conn
    }

    /// Releases the lock early. Idempotent; a no-op if already released.
    pub async fn release(mut self) -> Result<(), VpnctlError> {
        self.release_inner().await
    }

    async fn release_inner(&mut self) -> Result<(), VpnctlError> {
        if self.released {
            return Ok(());
        }
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(self.lock_id)
            .execute(&mut *self.conn)
            .await?;
        self.released = true;
        Ok(())
    }
}

impl Drop for IpAllocGuard {
    fn drop(&mut self) {
        // Session-level advisory locks release automatically when the
        // backend session ends; an un-released guard just holds the lock
        // until the pool recycles this connection. Callers that need
        // prompt release must call `release()` explicitly — Drop can't
        // await the unlock query.
        if !self.released {
            tracing::warn!("IpAllocGuard dropped without explicit release()");
        }
    }
}
