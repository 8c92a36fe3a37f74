//! Bucket Manager: evaluates generation thresholds, decides whether a
//! bucket needs human approval or can auto-commit, and drives the bucket
//! status state machine end to end.
//!
//! The state machine itself follows the same status-transition-table shape
//! used across the claims domain model; the transaction shape mirrors
//! `services::approvals::ApprovalService`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    domain::models::{
        AssignmentMode, Bucket, BucketStatus, CheckPaymentStatus, CommitCriteria,
        GenerationThreshold, PaymentMode, WorkflowConfig,
    },
    domain::policy,
    infrastructure::{
        db::PgPool,
        event_bus::{BucketStatusChangeEvent, EventBus},
    },
};

use super::{check_payment::CheckPaymentService, errors::ServiceError};

/// Narrow capability surface `CheckPaymentService` needs back onto
/// `BucketManager` for the "assigning a check manually on an already
/// approved bucket immediately advances it" rule. Injected through a lazy
/// handle rather than a constructor argument, breaking the two services'
/// otherwise-circular `Arc` construction.
#[async_trait]
pub trait TransitionToGeneration: Send + Sync {
    async fn transition_to_generation(&self, bucket_id: Uuid) -> Result<(), ServiceError>;
}

pub struct BucketManager {
    pool: PgPool,
    event_bus: Arc<EventBus>,
    check_payment: Arc<CheckPaymentService>,
    require_acknowledgement_before_edi: bool,
}

impl BucketManager {
    pub fn new(
        pool: PgPool,
        event_bus: Arc<EventBus>,
        check_payment: Arc<CheckPaymentService>,
        require_acknowledgement_before_edi: bool,
    ) -> Self {
        Self {
            pool,
            event_bus,
            check_payment,
            require_acknowledgement_before_edi,
        }
    }

    /// Entry point driven by `services::threshold_monitor`'s fast loop: load
    /// the bucket and its rule's thresholds, and either gate on approval or
    /// auto-commit toward generation.
    pub async fn evaluate_bucket_thresholds(&self, bucket_id: Uuid) -> Result<(), ServiceError> {
        let bucket = self.load_bucket(bucket_id).await?;
        if bucket.status != BucketStatus::Accumulating {
            return Ok(());
        }

        let thresholds = self.load_thresholds(bucket.bucketing_rule_id).await?;
        let Some(threshold) = policy::first_firing_threshold(&bucket, &thresholds) else {
            return Ok(());
        };

        let criteria = self.load_commit_criteria(bucket.bucketing_rule_id).await?;

        if policy::requires_approval(&bucket, criteria.as_ref()) {
            self.mark_pending_approval(bucket_id).await
        } else {
            self.handle_auto_commit_with_payment(&bucket, threshold.id).await
        }
    }

    async fn handle_auto_commit_with_payment(&self, bucket: &Bucket, threshold_id: Uuid) -> Result<(), ServiceError> {
        let workflow_config = self.load_workflow_config(threshold_id).await?;

        let Some(workflow_config) = workflow_config else {
            warn!(bucket_id = %bucket.id, "no workflow configuration for fired threshold, committing without payment gate");
            return self.transition_to_generation(bucket.id).await;
        };

        match workflow_config.payment_mode {
            PaymentMode::NonePayment => self.transition_to_generation(bucket.id).await,
            PaymentMode::Manual => self.require_manual_payment(bucket.id).await,
            PaymentMode::Separate => match workflow_config.assignment_mode {
                AssignmentMode::Auto => {
                    self.check_payment
                        .assign_check_automatically_from_bucket(bucket.id, &bucket.payer_id, bucket.total_amount)
                        .await?;
                    self.transition_to_generation(bucket.id).await
                }
                AssignmentMode::Manual => self.require_manual_payment(bucket.id).await,
            },
        }
    }

    async fn require_manual_payment(&self, bucket_id: Uuid) -> Result<(), ServiceError> {
        sqlx::query("UPDATE buckets SET payment_required = true, updated_at = $1 WHERE id = $2")
            .bind(Utc::now())
            .bind(bucket_id)
            .execute(&self.pool)
            .await?;
        info!(%bucket_id, "bucket flagged as awaiting manual check assignment before generation");
        Ok(())
    }

    /// `validatePaymentReadiness`: if the bucket requires payment, a check
    /// must already be assigned, and — when the deployment requires it — the
    /// check must have reached ACKNOWLEDGED rather than merely ASSIGNED.
    fn validate_payment_readiness(&self, bucket: &Bucket, check_status: Option<CheckPaymentStatus>) -> Result<(), ServiceError> {
        if !bucket.payment_required {
            return Ok(());
        }

        let Some(status) = check_status else {
            return Err(ServiceError::PaymentRequired { bucket_id: bucket.id });
        };

        if self.require_acknowledgement_before_edi
            && !matches!(status, CheckPaymentStatus::Acknowledged | CheckPaymentStatus::Issued)
        {
            return Err(ServiceError::PaymentRequired { bucket_id: bucket.id });
        }

        Ok(())
    }

    /// Loads and locks the bucket row, rejecting the call outright if `to`
    /// is not a legal move from the bucket's current status. Returns the
    /// pre-transition bucket (for the payment-readiness check and for the
    /// event publish) alongside the open transaction.
    async fn begin_transition(
        &self,
        bucket_id: Uuid,
        to: BucketStatus,
    ) -> Result<(sqlx::Transaction<'_, sqlx::Postgres>, Bucket), ServiceError> {
        let mut tx = self.pool.begin().await?;
        let bucket = sqlx::query_as::<_, Bucket>("SELECT * FROM buckets WHERE id = $1 FOR UPDATE")
            .bind(bucket_id)
            .fetch_optional(tx.as_mut())
            .await?
            .ok_or_else(|| ServiceError::NotFound {
                entity: "bucket",
                id: bucket_id.to_string(),
            })?;

        if !policy::can_transition_to(bucket.status, to) {
            return Err(ServiceError::InvalidState {
                bucket_id,
                from: bucket.status.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }

        if to == BucketStatus::Generating {
            let check_status = if let Some(check_payment_id) = bucket.check_payment_id {
                sqlx::query_scalar::<_, CheckPaymentStatus>("SELECT status FROM check_payments WHERE id = $1")
                    .bind(check_payment_id)
                    .fetch_optional(tx.as_mut())
                    .await?
            } else {
                None
            };
            self.validate_payment_readiness(&bucket, check_status)?;
        }

        Ok((tx, bucket))
    }

    pub async fn transition_to_generation(&self, bucket_id: Uuid) -> Result<(), ServiceError> {
        let (mut tx, bucket) = self.begin_transition(bucket_id, BucketStatus::Generating).await?;
        let now = Utc::now();
        sqlx::query(
            "UPDATE buckets SET status = 'generating', generation_started_at = $1, updated_at = $1 WHERE id = $2",
        )
        .bind(now)
        .bind(bucket_id)
        .execute(tx.as_mut())
        .await?;
        tx.commit().await?;
        self.publish_transition(bucket_id, bucket.status, BucketStatus::Generating).await;
        Ok(())
    }

    pub async fn mark_pending_approval(&self, bucket_id: Uuid) -> Result<(), ServiceError> {
        let (mut tx, bucket) = self.begin_transition(bucket_id, BucketStatus::PendingApproval).await?;
        let now = Utc::now();
        sqlx::query(
            "UPDATE buckets SET status = 'pending_approval', awaiting_approval_since = $1, updated_at = $1 WHERE id = $2",
        )
        .bind(now)
        .bind(bucket_id)
        .execute(tx.as_mut())
        .await?;
        tx.commit().await?;
        self.publish_transition(bucket_id, bucket.status, BucketStatus::PendingApproval).await;
        Ok(())
    }

    pub async fn mark_completed(&self, bucket_id: Uuid) -> Result<(), ServiceError> {
        let (mut tx, bucket) = self.begin_transition(bucket_id, BucketStatus::Completed).await?;
        let now = Utc::now();
        sqlx::query(
            "UPDATE buckets SET status = 'completed', generation_completed_at = $1, updated_at = $1 WHERE id = $2",
        )
        .bind(now)
        .bind(bucket_id)
        .execute(tx.as_mut())
        .await?;
        tx.commit().await?;
        self.publish_transition(bucket_id, bucket.status, BucketStatus::Completed).await;
        Ok(())
    }

    pub async fn mark_failed(&self, bucket_id: Uuid, error_message: &str) -> Result<(), ServiceError> {
        let (mut tx, bucket) = self.begin_transition(bucket_id, BucketStatus::Failed).await?;
        let now = Utc::now();
        sqlx::query(
            "UPDATE buckets SET status = 'failed', last_error_message = $1, last_error_at = $2, updated_at = $2 WHERE id = $3",
        )
        .bind(error_message)
        .bind(now)
        .bind(bucket_id)
        .execute(tx.as_mut())
        .await?;
        tx.commit().await?;
        self.publish_transition(bucket_id, bucket.status, BucketStatus::Failed).await;
        Ok(())
    }

    pub async fn mark_missing_configuration(&self, bucket_id: Uuid, detail: &str) -> Result<(), ServiceError> {
        let (mut tx, bucket) = self.begin_transition(bucket_id, BucketStatus::MissingConfiguration).await?;
        let now = Utc::now();
        sqlx::query(
            "UPDATE buckets SET status = 'missing_configuration', last_error_message = $1, last_error_at = $2, updated_at = $2 WHERE id = $3",
        )
        .bind(detail)
        .bind(now)
        .bind(bucket_id)
        .execute(tx.as_mut())
        .await?;
        tx.commit().await?;
        self.publish_transition(bucket_id, bucket.status, BucketStatus::MissingConfiguration).await;
        Ok(())
    }

    async fn publish_transition(&self, bucket_id: Uuid, previous_status: BucketStatus, new_status: BucketStatus) {
        self.event_bus.publish(BucketStatusChangeEvent {
            bucket_id,
            previous_status,
            new_status,
            occurred_at: Utc::now(),
        });
    }

    async fn load_bucket(&self, bucket_id: Uuid) -> Result<Bucket, ServiceError> {
        sqlx::query_as::<_, Bucket>("SELECT * FROM buckets WHERE id = $1")
            .bind(bucket_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ServiceError::NotFound {
                entity: "bucket",
                id: bucket_id.to_string(),
            })
    }

    pub async fn load_bucket_public(&self, bucket_id: Uuid) -> Result<Bucket, ServiceError> {
        self.load_bucket(bucket_id).await
    }

    async fn load_thresholds(&self, rule_id: Uuid) -> Result<Vec<GenerationThreshold>, ServiceError> {
        let rows = sqlx::query_as::<_, GenerationThreshold>(
            "SELECT * FROM generation_thresholds WHERE linked_bucketing_rule_id = $1 AND is_active = true",
        )
        .bind(rule_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn load_commit_criteria(&self, rule_id: Uuid) -> Result<Option<CommitCriteria>, ServiceError> {
        let row = sqlx::query_as::<_, CommitCriteria>(
            "SELECT * FROM commit_criteria WHERE linked_bucketing_rule_id = $1",
        )
        .bind(rule_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn load_workflow_config(&self, threshold_id: Uuid) -> Result<Option<WorkflowConfig>, ServiceError> {
        let row = sqlx::query_as::<_, WorkflowConfig>(
            "SELECT * FROM workflow_configs WHERE linked_threshold_id = $1",
        )
        .bind(threshold_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Public wrapper used by `services::approvals::ApprovalWorkflow` to
    /// resolve the payment mode for a bucket it is about to approve, without
    /// exposing the private threshold/criteria loaders.
    pub async fn resolve_workflow_config_for_bucket(&self, bucket: &Bucket) -> Result<Option<WorkflowConfig>, ServiceError> {
        let thresholds = self.load_thresholds(bucket.bucketing_rule_id).await?;
        let Some(threshold) = policy::first_firing_threshold(bucket, &thresholds) else {
            return Ok(None);
        };
        self.load_workflow_config(threshold.id).await
    }
}

#[async_trait]
impl TransitionToGeneration for BucketManager {
    async fn transition_to_generation(&self, bucket_id: Uuid) -> Result<(), ServiceError> {
        BucketManager::transition_to_generation(self, bucket_id).await
    }
}

