//! The two periodic background loops that keep subscription state honest
//! without any webhook to drive it: expiring subscriptions whose time has
//! run out, and sending renewal reminders ahead of that.

pub mod expiry;
pub mod reminder;

pub use expiry::run_expiry_worker;
pub use reminder::run_reminder_worker;
