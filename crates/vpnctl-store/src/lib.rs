pub mod db;
pub mod ip_lock;
pub mod points;
pub mod promo;
pub mod referrals;
pub mod subscriptions;
pub mod tariffs;

pub use db::Store;
pub use ip_lock::IpAllocGuard;
pub use points::AddPointsResult;
pub use promo::PromoRedemption;
pub use referrals::ReferralAward;

#[cfg(test)]
mod tests {
    // Every query here needs a live Postgres connection, so there is
    // nothing to unit-test in isolation; the pure-computation bonus-rounding
    // logic that doesn't touch the database is covered in vpnctl-points.
}
