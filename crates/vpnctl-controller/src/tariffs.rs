use rust_decimal::Decimal;
use std::str::FromStr;

/// Hard-coded fallback table, consulted only when the `tariffs` row is
/// missing or the Store is briefly unreachable — the original kept these
/// as module-level dicts precisely so a Store outage never blocks
/// provisioning a tariff whose duration is common knowledge.
const FALLBACK_DAYS: &[(&str, i64)] = &[
    ("1m", 30),
    ("3m", 90),
    ("6m", 180),
    ("1y", 365),
    ("forever", 3650),
];

/// Card-provider expected charge amounts (RUB), used only to sanity-log the
/// out-of-band re-verification response; currency mismatch is fatal but a
/// mismatched amount against this table is not (see card::handle_card_payment_succeeded).
const FALLBACK_AMOUNTS_RUB: &[(&str, &str)] = &[
    ("1m", "100.00"),
    ("3m", "270.00"),
    ("6m", "480.00"),
    ("1y", "840.00"),
    ("forever", "1990.00"),
];

pub fn fallback_days(tariff_code: &str) -> Option<i64> {
    FALLBACK_DAYS
        .iter()
        .find(|(c, _)| *c == tariff_code)
        .map(|(_, d)| *d)
}

pub fn fallback_amount_rub(tariff_code: &str) -> Option<Decimal> {
    FALLBACK_AMOUNTS_RUB
        .iter()
        .find(|(c, _)| *c == tariff_code)
        .and_then(|(_, a)| Decimal::from_str(a).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_resolve() {
        assert_eq!(fallback_days("1m"), Some(30));
        assert_eq!(fallback_days("forever"), Some(3650));
        assert_eq!(fallback_days("unknown"), None);
    }

    #[test]
    fn amounts_parse_as_decimal() {
        assert_eq!(fallback_amount_rub("3m"), Some(Decimal::from_str("270.00").unwrap()));
    }
}
