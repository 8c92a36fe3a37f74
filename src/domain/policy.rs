//! Pure threshold and commit-criteria evaluation.
//!
//! Backing logic for `services::bucket_manager::BucketManager::
//! evaluate_bucket_thresholds`, kept free of persistence so its predicates
//! can be unit tested without a database connection.

use chrono::Utc;
use tracing::warn;

use crate::domain::models::{
    Bucket, BucketStatus, CommitCriteria, CommitMode, GenerationThreshold, ThresholdType,
};

/// Legal bucket status transitions. Called under the bucket row's `FOR
/// UPDATE` lock by `services::bucket_manager::BucketManager::begin_transition`.
pub fn can_transition_to(from: BucketStatus, to: BucketStatus) -> bool {
    use BucketStatus::*;
    matches!(
        (from, to),
        (Accumulating, PendingApproval)
            | (Accumulating, Generating)
            | (Accumulating, MissingConfiguration)
            | (PendingApproval, Generating)
            | (PendingApproval, Failed)
            | (Generating, Completed)
            | (Generating, Failed)
            | (Failed, Accumulating)
            | (MissingConfiguration, Accumulating)
    )
}

/// Evaluates a single threshold against a bucket's current accumulation.
pub fn threshold_fires(bucket: &Bucket, threshold: &GenerationThreshold) -> bool {
    match threshold.threshold_type {
        ThresholdType::ClaimCount => claim_count_fires(bucket, threshold),
        ThresholdType::Amount => amount_fires(bucket, threshold),
        ThresholdType::Time => time_fires(bucket, threshold),
        ThresholdType::Hybrid => {
            claim_count_fires(bucket, threshold)
                || amount_fires(bucket, threshold)
                || time_fires(bucket, threshold)
        }
    }
}

fn claim_count_fires(bucket: &Bucket, threshold: &GenerationThreshold) -> bool {
    threshold
        .max_claims
        .map(|max| bucket.claim_count >= max)
        .unwrap_or(false)
}

fn amount_fires(bucket: &Bucket, threshold: &GenerationThreshold) -> bool {
    threshold
        .max_amount
        .map(|max| bucket.total_amount >= max)
        .unwrap_or(false)
}

fn time_fires(bucket: &Bucket, threshold: &GenerationThreshold) -> bool {
    threshold
        .time_duration
        .map(|duration| {
            let elapsed = Utc::now().signed_duration_since(bucket.created_at);
            elapsed.num_hours() >= duration.hours()
        })
        .unwrap_or(false)
}

/// Finds the first active threshold (in persistence order) that fires for
/// `bucket`, short-circuiting on the first match.
pub fn first_firing_threshold<'a>(
    bucket: &Bucket,
    thresholds: &'a [GenerationThreshold],
) -> Option<&'a GenerationThreshold> {
    thresholds
        .iter()
        .filter(|t| t.is_active)
        .find(|t| threshold_fires(bucket, t))
}

/// Decides whether a fired threshold requires human approval under the given
/// commit criteria. A caller should already have resolved `criteria` for
/// the bucket's rule; this function never looks it up itself.
pub fn requires_approval(bucket: &Bucket, criteria: Option<&CommitCriteria>) -> bool {
    let Some(criteria) = criteria else {
        warn!(
            bucket_id = %bucket.id,
            "no commit criteria resolved for bucket's rule, defaulting to AUTO"
        );
        return false;
    };

    match criteria.commit_mode {
        CommitMode::Auto => false,
        CommitMode::Manual => true,
        CommitMode::Hybrid => {
            let claim_count_exceeded = criteria
                .approval_claim_count_threshold
                .map(|threshold| bucket.claim_count >= threshold)
                .unwrap_or(false);
            let amount_exceeded = criteria
                .approval_amount_threshold
                .map(|threshold| bucket.total_amount >= threshold)
                .unwrap_or(false);
            let roles_configured = !criteria.approval_roles.is_empty();

            claim_count_exceeded || amount_exceeded || roles_configured
        }
    }
}

/// Placeholder role-based authorisation policy: true if any comma-separated
/// role, uppercased, contains ADMIN, MANAGER, or APPROVER. A real
/// implementation should consume `CommitCriteria::approval_roles` instead;
/// tracked as an open extension point.
pub fn is_authorized_to_approve(roles_csv: &str) -> bool {
    roles_csv.split(',').map(str::trim).any(|role| {
        let upper = role.to_uppercase();
        upper.contains("ADMIN") || upper.contains("MANAGER") || upper.contains("APPROVER")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn bucket(claim_count: i32, total_amount: Decimal, created_hours_ago: i64) -> Bucket {
        use crate::domain::models::{BucketStatus, PaymentStatus};
        Bucket {
            id: Uuid::new_v4(),
            bucketing_rule_id: Uuid::new_v4(),
            payer_id: "BCBS".into(),
            payer_name: "Blue Cross".into(),
            payee_id: "PHR_001".into(),
            payee_name: "Acme Pharmacy".into(),
            bin_number: None,
            pcn_number: None,
            status: BucketStatus::Accumulating,
            claim_count,
            total_amount,
            file_naming_template_id: None,
            created_at: Utc::now() - Duration::hours(created_hours_ago),
            updated_at: Utc::now(),
            awaiting_approval_since: None,
            generation_started_at: None,
            generation_completed_at: None,
            approved_by: None,
            approved_at: None,
            payment_required: false,
            payment_status: PaymentStatus::None,
            check_payment_id: None,
            last_error_message: None,
            last_error_at: None,
        }
    }

    fn claim_count_threshold(max: i32) -> GenerationThreshold {
        GenerationThreshold {
            id: Uuid::new_v4(),
            threshold_type: ThresholdType::ClaimCount,
            linked_bucketing_rule_id: Uuid::new_v4(),
            max_claims: Some(max),
            max_amount: None,
            time_duration: None,
            is_active: true,
        }
    }

    #[test]
    fn claim_count_threshold_fires_at_exact_boundary() {
        let b = bucket(3, Decimal::new(3000, 2), 0);
        let t = claim_count_threshold(3);
        assert!(threshold_fires(&b, &t));
    }

    #[test]
    fn claim_count_threshold_does_not_fire_below_boundary() {
        let b = bucket(2, Decimal::new(2000, 2), 0);
        let t = claim_count_threshold(3);
        assert!(!threshold_fires(&b, &t));
    }

    #[test]
    fn time_threshold_fires_after_duration_elapses() {
        let b = bucket(1, Decimal::new(1000, 2), 25);
        let t = GenerationThreshold {
            id: Uuid::new_v4(),
            threshold_type: ThresholdType::Time,
            linked_bucketing_rule_id: Uuid::new_v4(),
            max_claims: None,
            max_amount: None,
            time_duration: Some(crate::domain::models::TimeDuration::Daily),
            is_active: true,
        };
        assert!(threshold_fires(&b, &t));
    }

    #[test]
    fn first_firing_threshold_skips_inactive_rows() {
        let b = bucket(5, Decimal::new(5000, 2), 0);
        let mut inactive = claim_count_threshold(1);
        inactive.is_active = false;
        let active = claim_count_threshold(5);
        let thresholds = vec![inactive, active.clone()];
        let fired = first_firing_threshold(&b, &thresholds).unwrap();
        assert_eq!(fired.id, active.id);
    }

    #[test]
    fn auto_commit_never_requires_approval() {
        let b = bucket(10, Decimal::new(100_000, 2), 0);
        let criteria = CommitCriteria {
            id: Uuid::new_v4(),
            linked_bucketing_rule_id: b.bucketing_rule_id,
            commit_mode: CommitMode::Auto,
            approval_claim_count_threshold: Some(1),
            approval_amount_threshold: Some(Decimal::ONE),
            approval_roles: vec!["ADMIN".into()],
        };
        assert!(!requires_approval(&b, Some(&criteria)));
    }

    #[test]
    fn hybrid_requires_approval_when_amount_threshold_exceeded() {
        let b = bucket(1, Decimal::new(60_000, 2), 0);
        let criteria = CommitCriteria {
            id: Uuid::new_v4(),
            linked_bucketing_rule_id: b.bucketing_rule_id,
            commit_mode: CommitMode::Hybrid,
            approval_claim_count_threshold: None,
            approval_amount_threshold: Some(Decimal::new(50_000, 2)),
            approval_roles: vec![],
        };
        assert!(requires_approval(&b, Some(&criteria)));
    }

    #[test]
    fn missing_criteria_defaults_to_auto() {
        let b = bucket(1, Decimal::ONE, 0);
        assert!(!requires_approval(&b, None));
    }

    #[test]
    fn authorization_policy_matches_manager_role_case_insensitively() {
        assert!(is_authorized_to_approve("employee,manager"));
        assert!(is_authorized_to_approve("Approver"));
        assert!(!is_authorized_to_approve("employee,contractor"));
    }

    #[test]
    fn accumulating_can_move_to_pending_approval_or_generating() {
        assert!(can_transition_to(BucketStatus::Accumulating, BucketStatus::PendingApproval));
        assert!(can_transition_to(BucketStatus::Accumulating, BucketStatus::Generating));
    }

    #[test]
    fn completed_is_terminal() {
        assert!(!can_transition_to(BucketStatus::Completed, BucketStatus::Accumulating));
        assert!(!can_transition_to(BucketStatus::Completed, BucketStatus::Generating));
    }

    #[test]
    fn failed_bucket_can_be_reset_to_accumulating() {
        assert!(can_transition_to(BucketStatus::Failed, BucketStatus::Accumulating));
    }

    #[test]
    fn generating_cannot_jump_back_to_pending_approval() {
        assert!(!can_transition_to(BucketStatus::Generating, BucketStatus::PendingApproval));
    }

    #[test]
    fn pending_approval_can_be_rejected_to_failed_but_not_reset_directly() {
        assert!(can_transition_to(BucketStatus::PendingApproval, BucketStatus::Failed));
        assert!(!can_transition_to(BucketStatus::PendingApproval, BucketStatus::Accumulating));
    }
}
