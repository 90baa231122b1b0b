use std::sync::Arc;
use std::time::Duration;

use chrono::{Timelike, Utc};
use tracing::{info, warn};
use vpnctl_core::VpnctlError;
use vpnctl_notify::Notifier;
use vpnctl_store::Store;

/// One of the three fixed pre-expiry windows the reminder worker sweeps,
/// each backed by its own dedupe marker in `subscription_notifications`.
struct ReminderWindow {
    min_hours: i64,
    max_hours: i64,
    notification_type: &'static str,
    message: &'static str,
}

const WINDOWS: &[ReminderWindow] = &[
    ReminderWindow {
        min_hours: 60,
        max_hours: 73,
        notification_type: "expires_3d",
        message: "Ваша подписка истекает через 3 дня. Продлите её, чтобы не потерять доступ.",
    },
    ReminderWindow {
        min_hours: 12,
        max_hours: 25,
        notification_type: "expires_1d",
        message: "Ваша подписка истекает через 1 день. Продлите её, чтобы не потерять доступ.",
    },
    ReminderWindow {
        min_hours: 1,
        max_hours: 2,
        notification_type: "expires_1h",
        message: "Ваша подписка истекает менее чем через час.",
    },
];

/// W2 — reminder scheduler. Every `interval` seconds, unless the server
/// clock hour falls inside the quiet-hours window: for each of the three
/// fixed windows, find active subscriptions entering it that haven't
/// already received that window's reminder, deliver the message, and mark
/// it sent.
pub async fn run_reminder_worker(
    store: Arc<Store>,
    notifier: Arc<dyn Notifier>,
    interval: Duration,
    quiet_hours_start_utc: u32,
    quiet_hours_end_utc: u32,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if in_quiet_hours(Utc::now().hour(), quiet_hours_start_utc, quiet_hours_end_utc) {
            continue;
        }
        for window in WINDOWS {
            if let Err(e) = sweep_window(&store, &notifier, window).await {
                warn!(error = %e, notification_type = window.notification_type, "reminder sweep failed");
            }
        }
    }
}

async fn sweep_window(store: &Store, notifier: &Arc<dyn Notifier>, window: &ReminderWindow) -> Result<(), VpnctlError> {
    let due = store
        .get_subscriptions_needing_reminder(window.min_hours, window.max_hours, window.notification_type)
        .await?;
    if due.is_empty() {
        return Ok(());
    }
    info!(count = due.len(), notification_type = window.notification_type, "sending renewal reminders");
    for sub in due {
        if let Err(e) = notifier.send_text(sub.telegram_user_id, window.message).await {
            warn!(error = %e, telegram_user_id = sub.telegram_user_id, "user unreachable for reminder");
            continue;
        }
        if let Err(e) = store
            .record_notification_sent(sub.id, sub.telegram_user_id, sub.expires_at, window.notification_type)
            .await
        {
            warn!(error = %e, subscription_id = sub.id, "failed to record reminder dedupe marker");
        }
    }
    Ok(())
}

/// `start`/`end` describe an overnight quiet window (e.g. 22 -> 8): quiet
/// whenever `hour >= start` or `hour < end`. If `start <= end` the window
/// doesn't wrap and quiet is simply `start <= hour < end`.
fn in_quiet_hours(hour: u32, start: u32, end: u32) -> bool {
    if start <= end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overnight_window_wraps_midnight() {
        assert!(in_quiet_hours(23, 22, 8));
        assert!(in_quiet_hours(2, 22, 8));
        assert!(!in_quiet_hours(12, 22, 8));
        assert!(!in_quiet_hours(8, 22, 8));
    }

    #[test]
    fn non_wrapping_window() {
        assert!(in_quiet_hours(10, 9, 22));
        assert!(!in_quiet_hours(23, 9, 22));
    }

    #[test]
    fn windows_are_ordered_by_urgency() {
        assert!(WINDOWS[0].max_hours > WINDOWS[1].max_hours);
        assert!(WINDOWS[1].max_hours > WINDOWS[2].max_hours);
    }
}
