//! Canonicalises payer/payee identifiers and derives ISA/GS sender ids.
//!
//! Pure functions only — no I/O, no fallible paths. Used by
//! `services::aggregator` when auto-creating payer/payee master rows and by
//! `infrastructure::x12` when populating the ISA06/ISA08 envelope fields.

use std::time::{SystemTime, UNIX_EPOCH};

/// Uppercases `s`, maps `-`, `.` and spaces to `_`, strips anything outside
/// `[A-Z0-9_]`, collapses runs of `_`, and trims leading/trailing `_`.
///
/// Idempotent: `normalize_payer_payee_id(normalize_payer_payee_id(s)) ==
/// normalize_payer_payee_id(s)` for all `s`.
pub fn normalize_payer_payee_id(s: &str) -> String {
    let mut mapped = String::with_capacity(s.len());
    for ch in s.to_uppercase().chars() {
        match ch {
            '-' | '.' | ' ' => mapped.push('_'),
            c if c.is_ascii_alphanumeric() || c == '_' => mapped.push(c),
            _ => {}
        }
    }

    let mut collapsed = String::with_capacity(mapped.len());
    let mut last_was_underscore = false;
    for ch in mapped.chars() {
        if ch == '_' {
            if !last_was_underscore {
                collapsed.push(ch);
            }
            last_was_underscore = true;
        } else {
            collapsed.push(ch);
            last_was_underscore = false;
        }
    }

    collapsed.trim_matches('_').to_string()
}

/// Derives a 15-char alphanumeric ISA06/ISA08 sender id from a payer id.
/// Falls back to `PAYER{epochMillis mod 10000}` when normalisation yields
/// nothing usable — this function never fails.
pub fn generate_isa_sender_id(payer_id: &str) -> String {
    let normalized: String = normalize_payer_payee_id(payer_id)
        .chars()
        .filter(|c| *c != '_')
        .collect();

    if normalized.is_empty() {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        return format!("PAYER{}", millis % 10_000);
    }

    normalized.chars().take(15).collect()
}

/// Alias for `generate_isa_sender_id` — the GS02/GS03 application sender id
/// follows the same derivation as the ISA sender id.
pub fn generate_gs_application_sender_id(payer_id: &str) -> String {
    generate_isa_sender_id(payer_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_separators_and_collapses_underscores() {
        assert_eq!(normalize_payer_payee_id("Blue Cross-Shield."), "BLUE_CROSS_SHIELD");
    }

    #[test]
    fn normalize_trims_leading_and_trailing_underscores() {
        assert_eq!(normalize_payer_payee_id("  .BCBS.  "), "BCBS");
    }

    #[test]
    fn normalize_drops_punctuation_outside_allowed_set() {
        assert_eq!(normalize_payer_payee_id("BCBS#1 (East)"), "BCBS1_EAST");
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize_payer_payee_id("acme--pharmacy!!benefits");
        let twice = normalize_payer_payee_id(&once);
        assert_eq!(once, twice);
        assert!(once.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_'));
    }

    #[test]
    fn normalize_empty_when_no_alphanumerics() {
        assert_eq!(normalize_payer_payee_id("***"), "");
    }

    #[test]
    fn isa_sender_id_truncates_to_fifteen_chars() {
        let id = generate_isa_sender_id("a-very-long-payer-identifier-string");
        assert!(id.len() <= 15);
        assert_eq!(id, "AVERYLONGPAYERI");
    }

    #[test]
    fn isa_sender_id_falls_back_when_empty() {
        let id = generate_isa_sender_id("***");
        assert!(id.starts_with("PAYER"));
    }

    #[test]
    fn gs_application_sender_id_matches_isa_sender_id() {
        assert_eq!(
            generate_gs_application_sender_id("BCBS"),
            generate_isa_sender_id("BCBS")
        );
    }
}
