//! ANSI X12 835 Remittance Advice segment assembly.
//!
//! Kept behind a trait boundary the same way `infrastructure::storage`
//! abstracted over local/in-memory backends in the source codebase, so the
//! segment-serialisation strategy can be swapped without touching
//! `services::edi_generator`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use uuid::Uuid;

use crate::domain::identifiers::{generate_gs_application_sender_id, generate_isa_sender_id};
use crate::domain::models::{ClaimProcessingLog, ProcessingOutcome};

const SEGMENT_TERMINATOR: char = '~';
const ELEMENT_SEPARATOR: char = '*';
const SUB_ELEMENT_SEPARATOR: char = '>';

/// Everything the writer needs to materialise one 835 interchange. Built by
/// `services::edi_generator::EdiGenerator` from a `Bucket`, its accumulated
/// `ClaimProcessingLog` rows and the resolved payer/payee/check context.
#[derive(Debug, Clone)]
pub struct RemittanceAdvice {
    pub bucket_id: Uuid,
    pub payer_id: String,
    pub payer_name: String,
    pub payee_id: String,
    pub payee_name: String,
    pub total_paid_amount: Decimal,
    pub claims: Vec<ClaimProcessingLog>,
    pub check_number: Option<String>,
    pub check_date: Option<DateTime<Utc>>,
    pub interchange_control_number: u32,
    pub group_control_number: u32,
    pub transaction_set_control_number: u32,
    pub generated_at: DateTime<Utc>,
}

pub trait X12Writer: Send + Sync {
    /// Serialises `advice` to a complete ISA...IEA interchange. Returns the
    /// raw bytes ready to hand to `infrastructure::sftp`.
    fn write(&self, advice: &RemittanceAdvice) -> Vec<u8>;
}

/// The 835 writer used in production. Stateless; every call is pure given
/// its input.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardX12Writer;

impl X12Writer for StandardX12Writer {
    fn write(&self, advice: &RemittanceAdvice) -> Vec<u8> {
        let mut segments: Vec<String> = Vec::new();
        let isa_sender = generate_isa_sender_id(&advice.payer_id);
        let gs_sender = generate_gs_application_sender_id(&advice.payer_id);
        let timestamp = advice.generated_at;

        segments.push(isa_segment(&isa_sender, advice.interchange_control_number, timestamp));
        segments.push(gs_segment(&gs_sender, advice.group_control_number, timestamp));
        segments.push(st_segment(advice.transaction_set_control_number));

        let mut segment_count: u32 = 1; // ST counts toward SE01
        segments.push(bpr_segment(advice));
        segment_count += 1;
        segments.push(trn_segment(advice));
        segment_count += 1;

        segments.push(n1_segment("PR", &advice.payer_name, &advice.payer_id));
        segment_count += 1;
        segments.push(n1_segment("PE", &advice.payee_name, &advice.payee_id));
        segment_count += 1;

        for claim in advice
            .claims
            .iter()
            .filter(|c| c.outcome == ProcessingOutcome::Processed)
        {
            segments.push(clp_segment(claim));
            segment_count += 1;
            if claim.charge_amount != claim.paid_amount {
                segments.push(cas_segment(claim));
                segment_count += 1;
            }
            segments.push(nm1_segment(claim));
            segment_count += 1;
            segments.push(svc_segment(claim));
            segment_count += 1;
        }

        segments.push(se_segment(
            segment_count + 1,
            advice.transaction_set_control_number,
        ));
        segments.push(ge_segment(1, advice.group_control_number));
        segments.push(iea_segment(1, advice.interchange_control_number));

        let mut body = segments.join(&SEGMENT_TERMINATOR.to_string());
        body.push(SEGMENT_TERMINATOR);
        body.into_bytes()
    }
}

fn element(parts: &[&str]) -> String {
    parts.join(&ELEMENT_SEPARATOR.to_string())
}

fn isa_segment(sender_id: &str, control_number: u32, timestamp: DateTime<Utc>) -> String {
    let sender_padded = format!("{sender_id:<15}");
    let receiver_padded = format!("{:<15}", "REMIT835RCVR");
    format!(
        "{}{}{}",
        element(&[
            "ISA",
            "00",
            "          ",
            "00",
            "          ",
            "ZZ",
            &sender_padded,
            "ZZ",
            &receiver_padded,
            &timestamp.format("%y%m%d").to_string(),
            &timestamp.format("%H%M").to_string(),
            "U",
            "00501",
            &format!("{:09}", control_number),
            "0",
            "P",
        ]),
        ELEMENT_SEPARATOR,
        SUB_ELEMENT_SEPARATOR,
    )
}

fn gs_segment(sender_id: &str, control_number: u32, timestamp: DateTime<Utc>) -> String {
    element(&[
        "GS",
        "HP",
        sender_id,
        "REMIT835RCVR",
        &timestamp.format("%Y%m%d").to_string(),
        &timestamp.format("%H%M").to_string(),
        &control_number.to_string(),
        "X",
        "005010X221A1",
    ])
}

fn st_segment(control_number: u32) -> String {
    element(&["ST", "835", &format!("{:04}", control_number)])
}

fn bpr_segment(advice: &RemittanceAdvice) -> String {
    let cents = amount_to_cents(advice.total_paid_amount);
    element(&[
        "BPR",
        "I",
        &cents.to_string(),
        "C",
        "CHK",
        "",
        "",
        "",
        "",
        "",
        "",
        "",
        "",
        "",
        "",
        "",
        "",
        &advice.generated_at.format("%Y%m%d").to_string(),
    ])
}

fn trn_segment(advice: &RemittanceAdvice) -> String {
    let reference = advice
        .check_number
        .clone()
        .unwrap_or_else(|| advice.bucket_id.simple().to_string());
    element(&["TRN", "1", &reference, "1"])
}

fn n1_segment(qualifier: &str, name: &str, id: &str) -> String {
    element(&["N1", qualifier, name, "XX", id])
}

fn clp_segment(claim: &ClaimProcessingLog) -> String {
    let charge = claim.charge_amount.unwrap_or_default();
    let paid = claim.paid_amount.unwrap_or_default();
    element(&[
        "CLP",
        &claim.claim_id.simple().to_string(),
        "1",
        &amount_to_cents(charge).to_string(),
        &amount_to_cents(paid).to_string(),
        "0",
        "12",
        &claim.claim_id.simple().to_string(),
    ])
}

fn cas_segment(claim: &ClaimProcessingLog) -> String {
    let charge = claim.charge_amount.unwrap_or_default();
    let paid = claim.paid_amount.unwrap_or_default();
    let adjustment = (amount_to_cents(charge) - amount_to_cents(paid)).abs();
    element(&["CAS", "CO", "45", &adjustment.to_string()])
}

fn nm1_segment(claim: &ClaimProcessingLog) -> String {
    element(&[
        "NM1",
        "QC",
        "1",
        &claim.payee_id,
        "",
        "",
        "",
        "",
        "MI",
        &claim.claim_id.simple().to_string(),
    ])
}

fn svc_segment(claim: &ClaimProcessingLog) -> String {
    let charge = claim.charge_amount.unwrap_or_default();
    let paid = claim.paid_amount.unwrap_or_default();
    element(&[
        "SVC",
        "NU:PHARMACY",
        &amount_to_cents(charge).to_string(),
        &amount_to_cents(paid).to_string(),
    ])
}

fn se_segment(segment_count: u32, control_number: u32) -> String {
    element(&["SE", &segment_count.to_string(), &format!("{:04}", control_number)])
}

fn ge_segment(transaction_set_count: u32, control_number: u32) -> String {
    element(&["GE", &transaction_set_count.to_string(), &control_number.to_string()])
}

fn iea_segment(group_count: u32, control_number: u32) -> String {
    element(&[
        "IEA",
        &group_count.to_string(),
        &format!("{:09}", control_number),
    ])
}

/// Converts a decimal dollar amount to the whole-cents integer carried in
/// BPR02 per the `BPR02 = round(total*100)` testable property.
pub fn amount_to_cents(amount: Decimal) -> i64 {
    (amount * Decimal::from(100)).round().to_i64().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::ProcessingOutcome;

    fn sample_claim(charge: &str, paid: &str) -> ClaimProcessingLog {
        ClaimProcessingLog {
            id: Uuid::new_v4(),
            claim_id: Uuid::new_v4(),
            bucket_id: None,
            payer_id: "BCBS".into(),
            payee_id: "PHR001".into(),
            outcome: ProcessingOutcome::Processed,
            reason: None,
            charge_amount: Some(charge.parse().unwrap()),
            paid_amount: Some(paid.parse().unwrap()),
            processed_at: Utc::now(),
        }
    }

    fn sample_advice(claims: Vec<ClaimProcessingLog>) -> RemittanceAdvice {
        RemittanceAdvice {
            bucket_id: Uuid::new_v4(),
            payer_id: "BCBS".into(),
            payer_name: "Blue Cross Blue Shield".into(),
            payee_id: "PHR001".into(),
            payee_name: "Acme Pharmacy".into(),
            total_paid_amount: claims
                .iter()
                .map(|c| c.paid_amount.unwrap_or_default())
                .sum(),
            claims,
            check_number: Some("100045".into()),
            check_date: Some(Utc::now()),
            interchange_control_number: 1,
            group_control_number: 1,
            transaction_set_control_number: 1,
            generated_at: Utc::now(),
        }
    }

    #[test]
    fn writer_opens_with_isa_and_closes_with_iea() {
        let advice = sample_advice(vec![sample_claim("100.00", "90.00")]);
        let bytes = StandardX12Writer.write(&advice);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("ISA"));
        assert!(text.trim_end_matches(SEGMENT_TERMINATOR).ends_with(&iea_segment(1, 1)));
    }

    #[test]
    fn se01_counts_every_segment_between_st_and_se_inclusive() {
        let advice = sample_advice(vec![sample_claim("100.00", "100.00")]);
        let bytes = StandardX12Writer.write(&advice);
        let text = String::from_utf8(bytes).unwrap();
        let segments: Vec<&str> = text.trim_end_matches(SEGMENT_TERMINATOR).split(SEGMENT_TERMINATOR).collect();
        let st_index = segments.iter().position(|s| s.starts_with("ST*")).unwrap();
        let se_index = segments.iter().position(|s| s.starts_with("SE*")).unwrap();
        let expected_count = se_index - st_index + 1;
        let se_fields: Vec<&str> = segments[se_index].split(ELEMENT_SEPARATOR).collect();
        let declared_count: usize = se_fields[1].parse().unwrap();
        assert_eq!(declared_count, expected_count);
    }

    #[test]
    fn bpr02_is_encoded_as_rounded_whole_cents() {
        let advice = sample_advice(vec![sample_claim("33.335", "33.335")]);
        let bytes = StandardX12Writer.write(&advice);
        let text = String::from_utf8(bytes).unwrap();
        let bpr = text.split(SEGMENT_TERMINATOR).find(|s| s.starts_with("BPR*")).unwrap();
        let fields: Vec<&str> = bpr.split(ELEMENT_SEPARATOR).collect();
        assert_eq!(fields[2], "3334");
    }

    #[test]
    fn skips_rejected_claims_from_clp_segments() {
        let mut rejected = sample_claim("50.00", "0.00");
        rejected.outcome = ProcessingOutcome::Rejected;
        let advice = sample_advice(vec![sample_claim("10.00", "10.00"), rejected]);
        let bytes = StandardX12Writer.write(&advice);
        let text = String::from_utf8(bytes).unwrap();
        let clp_count = text.split(SEGMENT_TERMINATOR).filter(|s| s.starts_with("CLP*")).count();
        assert_eq!(clp_count, 1);
    }

    #[test]
    fn amount_to_cents_rounds_half_up() {
        assert_eq!(amount_to_cents(Decimal::new(3335, 2)), 3335);
        assert_eq!(amount_to_cents("33.335".parse().unwrap()), 3334);
    }
}
