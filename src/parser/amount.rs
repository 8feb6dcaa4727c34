use std::str::FromStr;

use rust_decimal::Decimal;

/// Normalize a raw money string ("1.234,56 €", "€1,234.56 EUR", "25,00")
/// to a two-decimal amount.
///
/// Both decimal-comma and decimal-point conventions are accepted. When both
/// separators appear, the rightmost one is the decimal separator. A lone
/// separator followed by exactly three digits ("1,234" / "1.234") reads as
/// thousands grouping in one locale and as a fraction in the other, so it is
/// rejected rather than guessed.
pub fn normalize(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .replace('\u{a0}', " ")
        .to_uppercase()
        .replace("EUR", "")
        .replace('€', "")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();

    // Extraction captures run to the end of the numeric run, so sentence
    // punctuation right after the amount ("25.00. Danke!") rides along.
    // An amount never ends in a separator; strip them before they get
    // mistaken for grouping.
    let cleaned = cleaned.trim_end_matches(['.', ',']);

    if cleaned.is_empty() {
        return None;
    }

    let has_comma = cleaned.contains(',');
    let has_dot = cleaned.contains('.');

    let candidate = if has_comma && has_dot {
        let decimal_is_comma = cleaned.rfind(',') > cleaned.rfind('.');
        let (group_sep, decimal_sep) = if decimal_is_comma {
            ('.', ',')
        } else {
            (',', '.')
        };
        if cleaned.matches(decimal_sep).count() > 1 {
            return None;
        }
        let (integer, fraction) = cleaned.split_once(decimal_sep)?;
        format!("{}.{}", strip_grouping(integer, group_sep)?, fraction)
    } else if has_comma {
        resolve_single_separator(cleaned, ',')?
    } else if has_dot {
        resolve_single_separator(cleaned, '.')?
    } else {
        cleaned.to_string()
    };

    let value = Decimal::from_str(&candidate).ok()?;
    let mut value = value.round_dp(2);
    value.rescale(2);
    Some(value)
}

/// One separator kind present. Repeated occurrences can only be thousands
/// grouping; a single occurrence is the decimal separator unless it is
/// followed by exactly three digits, which is ambiguous.
fn resolve_single_separator(s: &str, sep: char) -> Option<String> {
    if s.matches(sep).count() > 1 {
        return strip_grouping(s, sep);
    }

    let (before, after) = s.split_once(sep)?;
    let fraction_digits = after.chars().filter(|c| c.is_ascii_digit()).count();
    let ambiguous = fraction_digits == 3 && after.len() == 3 && is_plausible_group_prefix(before);
    if ambiguous {
        return None;
    }

    Some(s.replace(sep, "."))
}

/// Remove thousands separators, but only from a well-formed grouped
/// integer: a leading group of one to three digits, then groups of exactly
/// three. Anything else ("1.23.45") is not grouping and not a number.
fn strip_grouping(s: &str, sep: char) -> Option<String> {
    let unsigned = s.trim_start_matches('-');
    let mut groups = unsigned.split(sep);

    let first = groups.next()?;
    if !is_plausible_group_prefix(first) {
        return None;
    }
    for group in groups {
        if group.len() != 3 || !group.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
    }

    Some(s.replace(sep, ""))
}

/// "1,234" could be one-thousand-odd; "0,234" or "1234,567" never is (a
/// leading thousands group is one to three digits and not a bare zero).
fn is_plausible_group_prefix(before: &str) -> bool {
    let digits = before.trim_start_matches('-');
    !digits.is_empty()
        && digits.len() <= 3
        && digits != "0"
        && digits.chars().all(|c| c.is_ascii_digit())
}

/// Currency markers other than euro found in a raw amount capture. The
/// pipeline handles a single provider in euros; anything else is skipped
/// with a reason rather than misbooked.
pub fn foreign_currency(raw: &str) -> Option<&'static str> {
    let upper = raw.to_uppercase();
    for (marker, code) in [
        ("$", "USD"),
        ("USD", "USD"),
        ("£", "GBP"),
        ("GBP", "GBP"),
        ("CHF", "CHF"),
        ("PLN", "PLN"),
    ] {
        if upper.contains(marker) {
            return Some(code);
        }
    }
    None
}
