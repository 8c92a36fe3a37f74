use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;
use uuid::Uuid;

/// Generates an enum backed by a `TEXT` column using its own `as_str`/
/// `FromStr` strings rather than `sqlx::Type`'s derive (which would encode
/// the Rust variant name itself, e.g. `"PendingApproval"`, not the
/// snake_case wire value every migration's `CHECK` constraint and every
/// hand-written query actually expects).
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $str:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $str),+
                }
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($str => Ok(Self::$variant),)+
                    other => Err(format!(concat!(stringify!($name), " has no variant {}"), other)),
                }
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.as_str().to_string()
            }
        }

        impl sqlx::Type<sqlx::Postgres> for $name {
            fn type_info() -> sqlx::postgres::PgTypeInfo {
                <&str as sqlx::Type<sqlx::Postgres>>::type_info()
            }

            fn compatible(ty: &sqlx::postgres::PgTypeInfo) -> bool {
                <&str as sqlx::Type<sqlx::Postgres>>::compatible(ty)
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Postgres> for $name {
            fn encode_by_ref(
                &self,
                buf: &mut <sqlx::Postgres as sqlx::Database>::ArgumentBuffer<'q>,
            ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
                <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Postgres> for $name {
            fn decode(
                value: <sqlx::Postgres as sqlx::Database>::ValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                let raw = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
                Self::from_str(raw).map_err(Into::into)
            }
        }
    };
}

string_enum!(BucketStatus {
    Accumulating => "accumulating",
    PendingApproval => "pending_approval",
    Generating => "generating",
    Completed => "completed",
    Failed => "failed",
    MissingConfiguration => "missing_configuration",
});

string_enum!(PaymentStatus {
    None => "none",
    Assigned => "assigned",
    Acknowledged => "acknowledged",
    Issued => "issued",
});

string_enum!(RuleType {
    PayerPayee => "payer_payee",
    BinPcn => "bin_pcn",
    Custom => "custom",
});

string_enum!(ThresholdType {
    ClaimCount => "claim_count",
    Amount => "amount",
    Time => "time",
    Hybrid => "hybrid",
});

string_enum!(TimeDuration {
    Daily => "daily",
    Weekly => "weekly",
    Biweekly => "biweekly",
    Monthly => "monthly",
});

impl TimeDuration {
    pub fn hours(&self) -> i64 {
        match self {
            TimeDuration::Daily => 24,
            TimeDuration::Weekly => 168,
            TimeDuration::Biweekly => 336,
            TimeDuration::Monthly => 720,
        }
    }
}

string_enum!(CommitMode {
    Auto => "auto",
    Manual => "manual",
    Hybrid => "hybrid",
});

string_enum!(CaseConversion {
    None => "none",
    Upper => "upper",
    Lower => "lower",
    Capitalize => "capitalize",
});

string_enum!(ResetFrequency {
    Daily => "daily",
    Monthly => "monthly",
    Yearly => "yearly",
    Never => "never",
});

string_enum!(ReservationStatus {
    Active => "active",
    Exhausted => "exhausted",
    Cancelled => "cancelled",
});

string_enum!(CheckPaymentStatus {
    Assigned => "assigned",
    Acknowledged => "acknowledged",
    Issued => "issued",
    Void => "void",
    Cancelled => "cancelled",
});

string_enum!(DeliveryStatus {
    Pending => "pending",
    Delivered => "delivered",
    Failed => "failed",
    Retry => "retry",
});

string_enum!(ProcessingOutcome {
    Processed => "processed",
    Rejected => "rejected",
});

string_enum!(ApprovalDecision {
    Approval => "approval",
    Rejection => "rejection",
    Override => "override",
});

string_enum!(PaymentMode {
    NonePayment => "none",
    Manual => "manual",
    Separate => "separate",
});

string_enum!(AssignmentMode {
    Auto => "auto",
    Manual => "manual",
});

/// A working set of claims destined for one 835 output file.
///
/// Invariants enforced outside the struct itself (see
/// `services::bucket_manager` and the partial unique index in
/// `migrations/`): at most one row with `status = accumulating` exists per
/// `(bucketing_rule_id, payer_id, payee_id, bin_number, pcn_number)`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Bucket {
    pub id: Uuid,
    pub bucketing_rule_id: Uuid,
    pub payer_id: String,
    pub payer_name: String,
    pub payee_id: String,
    pub payee_name: String,
    pub bin_number: Option<String>,
    pub pcn_number: Option<String>,
    pub status: BucketStatus,
    pub claim_count: i32,
    pub total_amount: Decimal,
    pub file_naming_template_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub awaiting_approval_since: Option<DateTime<Utc>>,
    pub generation_started_at: Option<DateTime<Utc>>,
    pub generation_completed_at: Option<DateTime<Utc>>,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub payment_required: bool,
    pub payment_status: PaymentStatus,
    pub check_payment_id: Option<Uuid>,
    pub last_error_message: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

/// Pharmacy claim as handed off by the (out of scope) NCPDP ingestion layer.
/// Not persisted directly; each one yields a `ClaimProcessingLog` row.
#[derive(Debug, Clone, Deserialize)]
pub struct Claim {
    pub id: Uuid,
    pub payer_id: String,
    pub payee_id: String,
    pub bin_number: Option<String>,
    pub pcn_number: Option<String>,
    pub total_charge_amount: Decimal,
    pub paid_amount: Decimal,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ClaimProcessingLog {
    pub id: Uuid,
    pub claim_id: Uuid,
    pub bucket_id: Option<Uuid>,
    pub payer_id: String,
    pub payee_id: String,
    pub outcome: ProcessingOutcome,
    pub reason: Option<String>,
    pub charge_amount: Option<Decimal>,
    pub paid_amount: Option<Decimal>,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BucketingRule {
    pub id: Uuid,
    pub rule_name: String,
    pub rule_type: RuleType,
    pub priority: i32,
    pub grouping_expression: Option<String>,
    pub linked_payer_id: Option<String>,
    pub linked_payee_id: Option<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct GenerationThreshold {
    pub id: Uuid,
    pub threshold_type: ThresholdType,
    pub linked_bucketing_rule_id: Uuid,
    pub max_claims: Option<i32>,
    pub max_amount: Option<Decimal>,
    pub time_duration: Option<TimeDuration>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CommitCriteria {
    pub id: Uuid,
    pub linked_bucketing_rule_id: Uuid,
    pub commit_mode: CommitMode,
    pub approval_claim_count_threshold: Option<i32>,
    pub approval_amount_threshold: Option<Decimal>,
    pub approval_roles: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowConfig {
    pub id: Uuid,
    pub linked_threshold_id: Uuid,
    pub payment_mode: PaymentMode,
    pub assignment_mode: AssignmentMode,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FileNamingTemplate {
    pub id: Uuid,
    pub template_name: String,
    pub template_pattern: String,
    pub case_conversion: CaseConversion,
    pub linked_bucketing_rule_id: Option<Uuid>,
    pub is_default: bool,
    pub reset_frequency: ResetFrequency,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FileNamingSequence {
    pub template_id: Uuid,
    pub payer_id: Option<String>,
    pub current_sequence: i32,
    pub reset_frequency: ResetFrequency,
    pub last_reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CheckReservation {
    pub id: Uuid,
    pub payer_id: String,
    pub check_number_start: String,
    pub check_number_end: String,
    pub total_checks: i32,
    pub checks_used: i32,
    pub status: ReservationStatus,
    pub bank_name: String,
    pub routing_number: Option<String>,
    pub account_number_last4: Option<String>,
}

impl CheckReservation {
    pub fn checks_remaining(&self) -> i32 {
        self.total_checks - self.checks_used
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CheckPayment {
    pub id: Uuid,
    pub bucket_id: Uuid,
    pub check_number: String,
    pub check_amount: Decimal,
    pub check_date: DateTime<Utc>,
    pub status: CheckPaymentStatus,
    pub assigned_by: String,
    pub assigned_at: DateTime<Utc>,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub issued_by: Option<String>,
    pub issued_at: Option<DateTime<Utc>>,
    pub void_reason: Option<String>,
    pub voided_by: Option<String>,
    pub voided_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CheckAuditLog {
    pub id: Uuid,
    pub check_payment_id: Uuid,
    pub action: String,
    pub amount: Option<Decimal>,
    pub performed_by: String,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FileGenerationHistory {
    pub id: Uuid,
    pub bucket_id: Uuid,
    pub generated_file_name: String,
    pub file_content: Vec<u8>,
    pub file_size: i64,
    pub claim_count: i32,
    pub total_amount: Decimal,
    pub generated_by: String,
    pub generated_at: DateTime<Utc>,
    pub delivery_status: DeliveryStatus,
    pub delivered_at: Option<DateTime<Utc>>,
    pub delivered_by: Option<String>,
    pub retry_count: i32,
    pub error_message: Option<String>,
}

/// Audit trail of approval/rejection/override decisions on a bucket.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ApprovalLog {
    pub id: Uuid,
    pub bucket_id: Uuid,
    pub decision: ApprovalDecision,
    pub performed_by: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payer {
    pub id: String,
    pub raw_name: String,
    pub isa_sender_id: String,
    pub sftp_host: Option<String>,
    pub sftp_port: Option<i32>,
    pub sftp_username: Option<String>,
    pub sftp_password_encrypted: Option<String>,
    pub sftp_path: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payee {
    pub id: String,
    pub raw_name: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}
