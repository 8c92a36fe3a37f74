//! Template Expander: renders a `FileNamingTemplate` pattern into a concrete
//! output file name, maintaining a per-(template, payer) sequence counter
//! that resets on the configured cadence.
//!
//! Grounded on `services::finance::FinanceService`'s counter-row locking for
//! export batch numbers in the source, generalised to arbitrary template
//! tokens; the `{name:option}` grammar and sanitisation rules are grounded
//! on the same source's export-file-naming helper.

use chrono::{DateTime, Datelike, Utc};
use sqlx::Row;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    domain::models::{Bucket, CaseConversion, FileNamingTemplate, ResetFrequency},
    infrastructure::db::PgPool,
};

use super::errors::ServiceError;

/// Everything `render_token` needs out of the bucket being named. Built from
/// a `Bucket` row rather than threading five separate string params through
/// `generate_file_name`.
pub struct FileNameContext<'a> {
    pub bucket_id: Uuid,
    pub payer_id: &'a str,
    pub payer_name: &'a str,
    pub payee_id: &'a str,
    pub payee_name: &'a str,
    pub bin_number: Option<&'a str>,
    pub pcn_number: Option<&'a str>,
}

impl<'a> FileNameContext<'a> {
    pub fn from_bucket(bucket: &'a Bucket) -> Self {
        Self {
            bucket_id: bucket.id,
            payer_id: &bucket.payer_id,
            payer_name: &bucket.payer_name,
            payee_id: &bucket.payee_id,
            payee_name: &bucket.payee_name,
            bin_number: bucket.bin_number.as_deref(),
            pcn_number: bucket.pcn_number.as_deref(),
        }
    }
}

const DISALLOWED_FILENAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

pub struct TemplateExpander {
    pool: PgPool,
}

impl TemplateExpander {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Validates that every `{token}` or `{token:option}` in `pattern` is one
    /// this expander knows how to render, that braces are balanced, and that
    /// the static (non-token) parts contain no filesystem-hostile
    /// characters. Used by the (out-of-scope) administration surface before
    /// a template is saved; exposed here so callers don't need to duplicate
    /// the supported-token list.
    pub fn validate_template(pattern: &str) -> Result<(), ServiceError> {
        if !braces_balanced(pattern) {
            return Err(ServiceError::ValidationFailure(
                "template pattern has unbalanced braces".into(),
            ));
        }

        let static_parts = strip_tokens(pattern);
        if static_parts.chars().any(|c| DISALLOWED_FILENAME_CHARS.contains(&c)) {
            return Err(ServiceError::ValidationFailure(format!(
                "template pattern contains a disallowed character outside its tokens: {static_parts}"
            )));
        }

        for (name, _option) in extract_tokens(pattern) {
            if !is_known_token(&name) {
                warn!(token = name.as_str(), "template pattern references an unknown token");
            }
        }
        Ok(())
    }

    /// Renders `template.template_pattern` against `ctx`, allocating the next
    /// sequence number first since most patterns reference it. Falls back to
    /// a fixed, always-renderable name if the template itself is malformed,
    /// so a bad template can never block generation outright.
    pub async fn generate_file_name(&self, template: &FileNamingTemplate, ctx: &FileNameContext<'_>) -> Result<String, ServiceError> {
        if Self::validate_template(&template.template_pattern).is_err() {
            warn!(template_id = %template.id, "template pattern failed validation; using exception fallback name");
            return Ok(exception_fallback_name(ctx));
        }

        let sequence = self.next_sequence(template.id, ctx.payer_id, template.reset_frequency).await?;
        let now = Utc::now();
        let mut rendered = template.template_pattern.clone();

        for (name, option) in extract_tokens(&template.template_pattern) {
            let raw = render_token(&name, option.as_deref(), ctx, sequence, now);
            let value = sanitize_filename_value(&raw);
            let placeholder = match option {
                Some(opt) => format!("{{{name}:{opt}}}"),
                None => format!("{{{name}}}"),
            };
            rendered = rendered.replace(&placeholder, &value);
        }

        let converted = apply_case_conversion(&rendered, template.case_conversion);
        Ok(ensure_extension(&converted))
    }

    async fn next_sequence(
        &self,
        template_id: Uuid,
        payer_id: &str,
        reset_frequency: ResetFrequency,
    ) -> Result<i32, ServiceError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT current_sequence, reset_frequency, last_reset_at FROM file_naming_sequences
             WHERE template_id = $1 AND payer_id IS NOT DISTINCT FROM $2
             FOR UPDATE",
        )
        .bind(template_id)
        .bind(payer_id)
        .fetch_optional(tx.as_mut())
        .await?;

        let now = Utc::now();
        let next = match row {
            Some(row) => {
                let current: i32 = row.get("current_sequence");
                let reset_frequency: ResetFrequency = row.get("reset_frequency");
                let last_reset_at: DateTime<Utc> = row.get("last_reset_at");
                let next = if should_reset(reset_frequency, last_reset_at, now) {
                    1
                } else {
                    current + 1
                };

                sqlx::query(
                    "UPDATE file_naming_sequences SET current_sequence = $1, last_reset_at = $2
                     WHERE template_id = $3 AND payer_id IS NOT DISTINCT FROM $4",
                )
                .bind(next)
                .bind(if next == 1 { now } else { last_reset_at })
                .bind(template_id)
                .bind(payer_id)
                .execute(tx.as_mut())
                .await?;
                next
            }
            None => {
                sqlx::query(
                    "INSERT INTO file_naming_sequences (template_id, payer_id, current_sequence, reset_frequency, last_reset_at)
                     VALUES ($1,$2,1,$3,$4)",
                )
                .bind(template_id)
                .bind(payer_id)
                .bind(reset_frequency)
                .bind(now)
                .execute(tx.as_mut())
                .await?;
                1
            }
        };

        tx.commit().await?;
        info!(%template_id, payer_id, sequence = next, "allocated file naming sequence");
        Ok(next)
    }
}

fn should_reset(frequency: ResetFrequency, last_reset_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    match frequency {
        ResetFrequency::Never => false,
        ResetFrequency::Daily => now.date_naive() != last_reset_at.date_naive(),
        ResetFrequency::Monthly => now.year() != last_reset_at.year() || now.month() != last_reset_at.month(),
        ResetFrequency::Yearly => now.year() != last_reset_at.year(),
    }
}

fn braces_balanced(pattern: &str) -> bool {
    let mut depth = 0i32;
    for c in pattern.chars() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

/// `{name}` or `{name:option}`. Returns `(name, option)` pairs in the order
/// they appear.
fn extract_tokens(pattern: &str) -> Vec<(String, Option<String>)> {
    let mut tokens = Vec::new();
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '{' {
            let mut body = String::new();
            for next in chars.by_ref() {
                if next == '}' {
                    break;
                }
                body.push(next);
            }
            match body.split_once(':') {
                Some((name, option)) => tokens.push((name.to_string(), Some(option.to_string()))),
                None => tokens.push((body, None)),
            }
        }
    }
    tokens
}

fn strip_tokens(pattern: &str) -> String {
    let mut out = String::new();
    let mut in_token = false;
    for c in pattern.chars() {
        match c {
            '{' => in_token = true,
            '}' => in_token = false,
            _ if !in_token => out.push(c),
            _ => {}
        }
    }
    out
}

fn is_known_token(token: &str) -> bool {
    matches!(
        token,
        "payerId"
            | "payerName"
            | "payeeId"
            | "payeeName"
            | "binNumber"
            | "pcnNumber"
            | "date"
            | "timestamp"
            | "sequenceNumber"
            | "bucketId"
    )
}

fn render_token(name: &str, option: Option<&str>, ctx: &FileNameContext<'_>, sequence: i32, now: DateTime<Utc>) -> String {
    match name {
        "payerId" => ctx.payer_id.to_string(),
        "payerName" => ctx.payer_name.to_string(),
        "payeeId" => ctx.payee_id.to_string(),
        "payeeName" => ctx.payee_name.to_string(),
        "binNumber" => ctx.bin_number.unwrap_or_default().to_string(),
        "pcnNumber" => ctx.pcn_number.unwrap_or_default().to_string(),
        "bucketId" => ctx.bucket_id.to_string(),
        "date" => now.format(&chrono_pattern(option.unwrap_or("yyyyMMdd"))).to_string(),
        "timestamp" => now.format(&chrono_pattern(option.unwrap_or("yyyyMMddHHmmss"))).to_string(),
        "sequenceNumber" => {
            let width: usize = option.and_then(|o| o.parse().ok()).unwrap_or(6);
            format!("{sequence:0width$}")
        }
        other => format!("{{{other}}}"),
    }
}

/// Translates the small subset of Java/`.NET`-style date tokens this
/// grammar uses (`yyyy`, `MM`, `dd`, `HH`, `mm`, `ss`) into `chrono`'s
/// `strftime` syntax.
fn chrono_pattern(pattern: &str) -> String {
    pattern
        .replace("yyyy", "%Y")
        .replace("MM", "%m")
        .replace("dd", "%d")
        .replace("HH", "%H")
        .replace("mm", "%M")
        .replace("ss", "%S")
}

/// Restricts a rendered token value to `[A-Za-z0-9_.-]`, turning spaces into
/// underscores and dropping anything else, then trims stray leading/trailing
/// underscores left behind by the substitution.
fn sanitize_filename_value(value: &str) -> String {
    let mapped: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else if c == ' ' {
                '_'
            } else {
                '\0'
            }
        })
        .filter(|&c| c != '\0')
        .collect();
    mapped.trim_matches('_').to_string()
}

fn ensure_extension(name: &str) -> String {
    if name.to_ascii_lowercase().ends_with(".835") {
        name.to_string()
    } else {
        format!("{name}.835")
    }
}

fn exception_fallback_name(ctx: &FileNameContext<'_>) -> String {
    let now = Utc::now();
    let short_id: String = ctx.bucket_id.to_string().chars().take(8).collect();
    format!(
        "{}_{}_{}_{}.835",
        sanitize_filename_value(ctx.payer_id),
        sanitize_filename_value(ctx.payee_id),
        now.format("%Y%m%d"),
        short_id
    )
}

fn apply_case_conversion(value: &str, conversion: CaseConversion) -> String {
    match conversion {
        CaseConversion::None => value.to_string(),
        CaseConversion::Upper => value.to_uppercase(),
        CaseConversion::Lower => value.to_lowercase(),
        CaseConversion::Capitalize => value
            .split('_')
            .map(|part| {
                let mut chars = part.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join("_"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_tokens_finds_name_and_option() {
        let tokens = extract_tokens("{payerId}_{payeeId}_{date:yyyyMMdd}_{sequenceNumber:6}");
        assert_eq!(
            tokens,
            vec![
                ("payerId".to_string(), None),
                ("payeeId".to_string(), None),
                ("date".to_string(), Some("yyyyMMdd".to_string())),
                ("sequenceNumber".to_string(), Some("6".to_string())),
            ]
        );
    }

    #[test]
    fn validate_template_warns_but_accepts_unknown_tokens() {
        assert!(TemplateExpander::validate_template("{payerId}_{bogus}").is_ok());
        assert!(TemplateExpander::validate_template("{payerId}_{sequenceNumber:6}").is_ok());
    }

    #[test]
    fn validate_template_rejects_unbalanced_braces() {
        assert!(TemplateExpander::validate_template("{payerId_{sequenceNumber:6}").is_err());
    }

    #[test]
    fn validate_template_rejects_disallowed_characters_in_static_parts() {
        assert!(TemplateExpander::validate_template("{payerId}/{payeeId}").is_err());
    }

    #[test]
    fn render_token_pads_sequence_number_to_requested_width() {
        let ctx = FileNameContext {
            bucket_id: Uuid::nil(),
            payer_id: "BCBS",
            payer_name: "Blue Cross",
            payee_id: "PHR_001",
            payee_name: "Acme Pharmacy",
            bin_number: None,
            pcn_number: None,
        };
        let now = Utc::now();
        assert_eq!(render_token("sequenceNumber", Some("6"), &ctx, 1, now), "000001");
        assert_eq!(render_token("sequenceNumber", Some("4"), &ctx, 1, now), "0001");
    }

    #[test]
    fn sanitize_filename_value_replaces_spaces_and_trims_underscores() {
        assert_eq!(sanitize_filename_value("Blue Cross"), "Blue_Cross");
        assert_eq!(sanitize_filename_value(" leading"), "leading");
    }

    #[test]
    fn ensure_extension_appends_835_once() {
        assert_eq!(ensure_extension("BCBS_PHR_001_20240517_000001"), "BCBS_PHR_001_20240517_000001.835");
        assert_eq!(ensure_extension("already.835"), "already.835");
    }

    #[test]
    fn apply_case_conversion_upper_and_capitalize() {
        assert_eq!(apply_case_conversion("remit_file", CaseConversion::Upper), "REMIT_FILE");
        assert_eq!(apply_case_conversion("remit_file", CaseConversion::Capitalize), "Remit_File");
    }

    #[test]
    fn should_reset_daily_when_date_changed() {
        let last = Utc::now() - chrono::Duration::days(1);
        assert!(should_reset(ResetFrequency::Daily, last, Utc::now()));
        assert!(!should_reset(ResetFrequency::Never, last, Utc::now()));
    }
}
