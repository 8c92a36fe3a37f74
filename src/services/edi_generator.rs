//! EDI Generator: assembles a `RemittanceAdvice` from an accumulated
//! bucket's claim logs, serialises it through `infrastructure::x12`, and
//! persists the result as `FileGenerationHistory`.

use std::sync::Arc;

use chrono::Utc;
use sqlx::Row;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    domain::models::{Bucket, BucketStatus, ClaimProcessingLog, FileNamingTemplate},
    infrastructure::{db::PgPool, x12::{RemittanceAdvice, X12Writer}},
};

use super::{
    bucket_manager::BucketManager, errors::ServiceError,
    template_expander::{FileNameContext, TemplateExpander},
};

pub struct EdiGenerator {
    pool: PgPool,
    x12_writer: Arc<dyn X12Writer>,
    bucket_manager: Arc<BucketManager>,
    template_expander: Arc<TemplateExpander>,
}

impl EdiGenerator {
    pub fn new(
        pool: PgPool,
        x12_writer: Arc<dyn X12Writer>,
        bucket_manager: Arc<BucketManager>,
        template_expander: Arc<TemplateExpander>,
    ) -> Self {
        Self {
            pool,
            x12_writer,
            bucket_manager,
            template_expander,
        }
    }

    /// Driven by `main`'s event bus subscriber when a bucket transitions to
    /// `GENERATING`. On any failure the bucket is marked `FAILED` with the
    /// triggering error so the Threshold Monitor's stale-bucket sweep and
    /// `ApprovalWorkflow::reset_failed_bucket` can recover it.
    pub async fn generate_for_bucket(&self, bucket_id: Uuid) -> Result<Uuid, ServiceError> {
        match self.try_generate(bucket_id).await {
            Ok(history_id) => Ok(history_id),
            Err(err) => {
                error!(%bucket_id, error = %err, "835 generation failed");
                self.bucket_manager.mark_failed(bucket_id, &err.to_string()).await?;
                Err(err)
            }
        }
    }

    async fn try_generate(&self, bucket_id: Uuid) -> Result<Uuid, ServiceError> {
        let bucket = sqlx::query_as::<_, Bucket>("SELECT * FROM buckets WHERE id = $1")
            .bind(bucket_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ServiceError::NotFound {
                entity: "bucket",
                id: bucket_id.to_string(),
            })?;

        if bucket.status != BucketStatus::Generating {
            return Err(ServiceError::InvalidState {
                bucket_id,
                from: bucket.status.as_str().to_string(),
                to: "generating".into(),
            });
        }

        let claims = sqlx::query_as::<_, ClaimProcessingLog>(
            "SELECT * FROM claim_processing_logs WHERE bucket_id = $1 ORDER BY processed_at ASC",
        )
        .bind(bucket_id)
        .fetch_all(&self.pool)
        .await?;

        let (check_number, check_date) = match bucket.check_payment_id {
            Some(id) => {
                let row = sqlx::query("SELECT check_number, check_date FROM check_payments WHERE id = $1")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?;
                match row {
                    Some(r) => (Some(r.get("check_number")), Some(r.get("check_date"))),
                    None => (None, None),
                }
            }
            None => (None, None),
        };

        let interchange_control_number = self.next_control_number().await?;
        let advice = RemittanceAdvice {
            bucket_id,
            payer_id: bucket.payer_id.clone(),
            payer_name: bucket.payer_name.clone(),
            payee_id: bucket.payee_id.clone(),
            payee_name: bucket.payee_name.clone(),
            total_paid_amount: bucket.total_amount,
            claims,
            check_number,
            check_date,
            interchange_control_number,
            group_control_number: interchange_control_number,
            // A generated file always contains exactly one transaction set,
            // so its control number always starts the counter fresh rather
            // than sharing the file-wide interchange/group counter.
            transaction_set_control_number: 1,
            generated_at: Utc::now(),
        };

        let file_content = self.x12_writer.write(&advice);
        let file_name = self.resolve_file_name(&bucket).await?;

        let history_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO file_generation_history (
                id, bucket_id, generated_file_name, file_content, file_size, claim_count,
                total_amount, generated_by, generated_at, delivery_status, retry_count
             ) VALUES ($1,$2,$3,$4,$5,$6,$7,'remit835-engine',$8,'pending',0)",
        )
        .bind(history_id)
        .bind(bucket_id)
        .bind(&file_name)
        .bind(&file_content)
        .bind(file_content.len() as i64)
        .bind(advice.claims.len() as i32)
        .bind(bucket.total_amount)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        self.bucket_manager.mark_completed(bucket_id).await?;
        info!(%bucket_id, %history_id, file_name, "835 remittance advice generated");
        Ok(history_id)
    }

    /// Sourced from a dedicated sequence rather than counting existing rows,
    /// so concurrent generations never race onto the same interchange
    /// control number.
    async fn next_control_number(&self) -> Result<u32, ServiceError> {
        let next: i64 = sqlx::query_scalar("SELECT nextval('file_generation_control_number_seq')")
            .fetch_one(&self.pool)
            .await?;
        Ok(next as u32)
    }

    async fn resolve_file_name(&self, bucket: &Bucket) -> Result<String, ServiceError> {
        let template = match bucket.file_naming_template_id {
            Some(id) => sqlx::query_as::<_, FileNamingTemplate>("SELECT * FROM file_naming_templates WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
            None => sqlx::query_as::<_, FileNamingTemplate>("SELECT * FROM file_naming_templates WHERE is_default = true LIMIT 1")
                .fetch_optional(&self.pool)
                .await?,
        };

        let ctx = FileNameContext::from_bucket(bucket);
        match template {
            Some(template) => self.template_expander.generate_file_name(&template, &ctx).await,
            None => Ok(format!("remit_{}_{}.835", bucket.payer_id, Utc::now().format("%Y%m%d%H%M%S"))),
        }
    }
}

