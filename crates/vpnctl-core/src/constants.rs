/// Default WireGuard network the client address allocator hands out from,
/// extended from a `/24` to a `/16` to outlast the original deployment's
/// address pressure.
pub const DEFAULT_WG_NETWORK_CIDR: &str = "10.8.0.0/16";

/// Server's own address inside `DEFAULT_WG_NETWORK_CIDR`; never allocated
/// to a client.
pub const DEFAULT_WG_SERVER_IP: &str = "10.8.0.1";

/// Walk at most this many referrer hops up the chain when distributing
/// per-level reward points.
pub const MAX_REFERRAL_LEVELS: usize = 5;

/// W1 (expiry sweeper) polling interval.
pub const DEFAULT_EXPIRY_WORKER_INTERVAL_SECS: u64 = 60;

/// W2 (reminder scheduler) polling interval.
pub const DEFAULT_REMINDER_WORKER_INTERVAL_SECS: u64 = 600;

/// Reminder windows before expiry, in whole days, that each produce at most
/// one notification per subscription.
pub const REMINDER_WINDOWS_DAYS: [i64; 3] = [3, 1, 0];

/// Default quiet hours (UTC) during which the reminder worker defers sends
/// until the window reopens — active hours are `[09..22)`, so quiet runs
/// from 22:00 through 09:00 the next day.
pub const DEFAULT_QUIET_HOURS_START_UTC: u32 = 22;
pub const DEFAULT_QUIET_HOURS_END_UTC: u32 = 9;
