use thiserror::Error;

#[derive(Debug, Error)]
pub enum VpnctlError {
    // ── Idempotency / verification ───────────────────────────────────────────
    #[error("event already processed: {0}")]
    IdempotencyHit(String),

    #[error("payment verification failed: {0}")]
    VerificationFailed(String),

    #[error("malformed webhook request: {0}")]
    MalformedRequest(String),

    #[error("stale payment rejected: event is older than the subscription's last event")]
    StalePayment,

    // ── Gateway / provisioning ───────────────────────────────────────────────
    #[error("WireGuard gateway is unreachable: {0}")]
    GatewayDown(String),

    #[error("no free client addresses left in the WireGuard network")]
    NoFreeAddresses,

    #[error("storage conflict: {0}")]
    StorageConflict(String),

    #[error("partial provisioning: peer added to gateway but subscription row not committed: {0}")]
    PartialProvisioning(String),

    #[error("user {0} unreachable on Telegram")]
    UserUnreachable(TelegramUserIdDisplay),

    // ── Business rules ────────────────────────────────────────────────────────
    #[error("event already processed")]
    AlreadyProcessed,

    #[error("per_user_limit_reached")]
    PerUserLimitReached,

    #[error("insufficient points: need {need}, have {have}")]
    InsufficientPoints { need: i64, have: i64 },

    #[error("tariff not found or inactive: {0}")]
    TariffNotFoundOrInactive(String),

    #[error("no active subscription for user {0}")]
    NoActiveSubscription(TelegramUserIdDisplay),

    #[error("user is blocked from referral rewards")]
    UserReferralBlocked,

    #[error("promo code has no uses left")]
    NoUsesLeft,

    #[error("cannot refer yourself")]
    SelfReferral,

    #[error("user already has a referrer")]
    AlreadyHasReferrer,

    #[error("points delta must not be zero")]
    ZeroPointsDelta,

    #[error("insufficient funds: balance would go negative")]
    InsufficientFunds,

    #[error("promo code not found or inactive: {0}")]
    PromoNotFoundOrInactive(String),

    #[error("promo code is outside its valid window")]
    PromoOutsideValidWindow,

    #[error("promo code does not apply to this tariff")]
    PromoTariffNotAllowed,

    #[error("promo code is restricted to a different Telegram id")]
    PromoTelegramIdMismatch,

    // ── Storage / transport ──────────────────────────────────────────────────
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("database migration error: {0}")]
    Migration(String),

    #[error("http client error: {0}")]
    Http(String),

    #[error("http request failed: {0}")]
    HttpRequest(#[from] reqwest::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

/// `TelegramUserId` is a bare `i64` alias, which `thiserror`'s `#[error]`
/// interpolation is happy to format directly; this wrapper exists only so
/// the error messages above read `user 123` instead of needing a second
/// positional field.
pub type TelegramUserIdDisplay = crate::types::TelegramUserId;
