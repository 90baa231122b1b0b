use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use vpnctl_store::Store;
use vpnctl_wireguard::Gateway;

// Qualified with the subscription id before use: `last_event_name` is
// unique across the whole table, so a bare constant would collide on the
// second expiry in any one sweep.
const EXPIRY_EVENT_NAME: &str = "expired";

/// W1 — expiry sweeper. Every `interval` seconds: find every active
/// subscription whose `expires_at` has passed, deactivate it, and tear down
/// its gateway peer. Runs until the process exits; a single sweep's
/// failures are logged and the loop continues on the next tick rather than
/// aborting the whole worker.
pub async fn run_expiry_worker(store: Arc<Store>, gateway: Gateway, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if let Err(e) = sweep_once(&store, &gateway).await {
            warn!(error = %e, "expiry sweep failed");
        }
    }
}

async fn sweep_once(store: &Store, gateway: &Gateway) -> Result<(), vpnctl_core::VpnctlError> {
    let expired = store.get_expired_active_subscriptions().await?;
    if expired.is_empty() {
        return Ok(());
    }
    info!(count = expired.len(), "deactivating expired subscriptions");
    for sub in expired {
        let event_name = format!("{EXPIRY_EVENT_NAME}_{}", sub.id);
        match store.deactivate_subscription_by_id(sub.id, &event_name).await {
            Ok(Some(deactivated)) => {
                if let Err(e) = gateway.remove_peer(&deactivated.client_public_key).await {
                    warn!(error = %e, subscription_id = deactivated.id, "failed to remove peer for expired subscription");
                }
            }
            Ok(None) => {} // already deactivated by a concurrent sweep or webhook
            Err(e) => warn!(error = %e, subscription_id = sub.id, "failed to deactivate expired subscription"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_name_is_stable() {
        assert_eq!(EXPIRY_EVENT_NAME, "expired");
    }
}
