//! Delivery Engine: hands a generated 835 file to SFTP, retrying with
//! backoff up to a configured attempt ceiling.
//!
//! Grounded on `infrastructure::storage::LocalStorage`'s error-to-retry
//! mapping in the source, generalised from a single write attempt to a
//! persisted retry counter.

use std::sync::Arc;

use chrono::Utc;
use sqlx::Row;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    domain::models::Payer,
    infrastructure::{
        config::DeliveryConfig,
        db::PgPool,
        encryption::Encryption,
        sftp::SftpClient,
    },
};

use super::errors::ServiceError;

pub struct DeliveryEngine {
    pool: PgPool,
    sftp_client: Arc<dyn SftpClient>,
    encryption: Arc<dyn Encryption>,
    config: DeliveryConfig,
}

impl DeliveryEngine {
    pub fn new(pool: PgPool, sftp_client: Arc<dyn SftpClient>, encryption: Arc<dyn Encryption>, config: DeliveryConfig) -> Self {
        Self {
            pool,
            sftp_client,
            encryption,
            config,
        }
    }

    /// Validates that a payer carries everything SFTP delivery needs,
    /// without attempting a connection. Used before `deliver_file` so a
    /// missing config surfaces as `ConfigurationMissing` rather than a
    /// connection-layer error.
    pub fn validate_sftp_config(payer: &Payer) -> Result<(), ServiceError> {
        let missing = [
            ("sftp_host", payer.sftp_host.is_none()),
            ("sftp_username", payer.sftp_username.is_none()),
            ("sftp_password_encrypted", payer.sftp_password_encrypted.is_none()),
            ("sftp_path", payer.sftp_path.is_none()),
        ]
        .into_iter()
        .filter(|(_, missing)| *missing)
        .map(|(field, _)| field)
        .collect::<Vec<_>>();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ServiceError::ConfigurationMissing {
                payer_id: payer.id.clone(),
                detail: format!("missing fields: {}", missing.join(", ")),
            })
        }
    }

    /// Idempotent if the file is already `DELIVERED`. Otherwise loops up to
    /// `max_retry_attempts` times, opening and closing one SFTP session per
    /// attempt, sleeping `base × 2^(attempt-1)` between attempts.
    pub async fn deliver_file(&self, history_id: Uuid) -> Result<(), ServiceError> {
        let row = sqlx::query(
            "SELECT fgh.generated_file_name, fgh.file_content, fgh.delivery_status, b.payer_id
             FROM file_generation_history fgh
             JOIN buckets b ON b.id = fgh.bucket_id
             WHERE fgh.id = $1",
        )
        .bind(history_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ServiceError::NotFound {
            entity: "file_generation_history",
            id: history_id.to_string(),
        })?;

        let delivery_status: String = row.get("delivery_status");
        if delivery_status == "delivered" {
            return Ok(());
        }

        let file_name: String = row.get("generated_file_name");
        let content: Vec<u8> = row.get("file_content");
        let payer_id: String = row.get("payer_id");

        let payer = sqlx::query_as::<_, Payer>("SELECT * FROM payers WHERE id = $1")
            .bind(&payer_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ServiceError::NotFound {
                entity: "payer",
                id: payer_id.clone(),
            })?;

        if let Err(err) = Self::validate_sftp_config(&payer) {
            self.record_permanent_failure(history_id, "No SFTP configuration").await?;
            return Err(err);
        }

        let decrypted_payer = self.decrypt_credentials(payer)?;

        let mut last_error = String::new();
        for attempt in 1..=self.config.max_retry_attempts {
            match self.sftp_client.put(&decrypted_payer, &file_name, &content).await {
                Ok(()) => {
                    self.mark_as_delivered(history_id).await?;
                    info!(%history_id, file_name, attempt, "835 file delivered");
                    return Ok(());
                }
                Err(err) => {
                    last_error = err.to_string();
                    self.record_attempt_failure(history_id, attempt, &last_error).await?;
                    if attempt < self.config.max_retry_attempts {
                        let backoff = self.config.retry_backoff_base_seconds * 2u64.pow(attempt - 1);
                        warn!(%history_id, attempt, backoff_seconds = backoff, "835 delivery attempt failed, retrying");
                        tokio::time::sleep(std::time::Duration::from_secs(backoff)).await;
                    }
                }
            }
        }

        let truncated: String = last_error.chars().take(1000).collect();
        self.record_permanent_failure(history_id, &truncated).await?;
        error!(%history_id, error_message = %truncated, "835 delivery permanently failed after exhausting retries");
        Err(ServiceError::DeliveryFailure {
            file_history_id: history_id,
            reason: truncated,
        })
    }

    fn decrypt_credentials(&self, mut payer: Payer) -> Result<Payer, ServiceError> {
        if let Some(encrypted) = payer.sftp_password_encrypted.take() {
            let decrypted = self
                .encryption
                .decrypt(&encrypted)
                .map_err(|err| ServiceError::ConfigurationMissing {
                    payer_id: payer.id.clone(),
                    detail: format!("unable to decrypt sftp credentials: {err}"),
                })?;
            payer.sftp_password_encrypted = Some(decrypted);
        }
        Ok(payer)
    }

    async fn mark_as_delivered(&self, history_id: Uuid) -> Result<(), ServiceError> {
        sqlx::query("UPDATE file_generation_history SET delivery_status = 'delivered', delivered_at = $1 WHERE id = $2")
            .bind(Utc::now())
            .bind(history_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Lets an operator record a delivery made outside the SFTP loop (e.g.
    /// hand-carried to a payer during an outage). Idempotent if the file is
    /// already `DELIVERED` so a retried operator action never overwrites
    /// `delivered_by`/`delivered_at`.
    pub async fn mark_delivered_manually(&self, history_id: Uuid, by: &str) -> Result<(), ServiceError> {
        let delivery_status: Option<String> = sqlx::query_scalar(
            "SELECT delivery_status FROM file_generation_history WHERE id = $1",
        )
        .bind(history_id)
        .fetch_optional(&self.pool)
        .await?;

        let delivery_status = delivery_status.ok_or_else(|| ServiceError::NotFound {
            entity: "file_generation_history",
            id: history_id.to_string(),
        })?;

        if delivery_status == "delivered" {
            return Ok(());
        }

        sqlx::query(
            "UPDATE file_generation_history
             SET delivery_status = 'delivered', delivered_at = $1, delivered_by = $2
             WHERE id = $3",
        )
        .bind(Utc::now())
        .bind(format!("{by} (manual)"))
        .bind(history_id)
        .execute(&self.pool)
        .await?;
        info!(%history_id, by, "835 file marked delivered manually");
        Ok(())
    }

    async fn record_attempt_failure(&self, history_id: Uuid, attempt: u32, error_message: &str) -> Result<(), ServiceError> {
        sqlx::query(
            "UPDATE file_generation_history SET retry_count = $1, delivery_status = 'retry', error_message = $2 WHERE id = $3",
        )
        .bind(attempt as i32)
        .bind(error_message)
        .bind(history_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_permanent_failure(&self, history_id: Uuid, error_message: &str) -> Result<(), ServiceError> {
        sqlx::query("UPDATE file_generation_history SET delivery_status = 'failed', error_message = $1 WHERE id = $2")
            .bind(error_message)
            .bind(history_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Driven by `jobs::spawn_delivery_sweeper`: the 5-minute cron picks up
    /// every `PENDING` file (never attempted) and every `RETRY` file (a
    /// process restart interrupted `deliver_file` between attempts, leaving
    /// it stranded mid-backoff); the hourly cron re-runs `FAILED` files whose
    /// `retry_count` is still under the configured ceiling. Failures are
    /// recorded and do not halt the sweep.
    pub async fn sweep_pending_deliveries(&self) -> Result<usize, ServiceError> {
        let rows = sqlx::query(
            "SELECT id FROM file_generation_history
             WHERE delivery_status = 'pending'
                OR (delivery_status IN ('retry', 'failed') AND retry_count < $1)
             ORDER BY generated_at
             LIMIT $2",
        )
        .bind(self.config.max_retry_attempts as i32)
        .bind(self.config.sweep_batch_size as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut attempted = 0;
        for row in rows {
            let history_id: Uuid = row.get("id");
            attempted += 1;
            if let Err(err) = self.deliver_file(history_id).await {
                warn!(%history_id, error = %err, "scheduled delivery attempt failed");
            }
        }
        Ok(attempted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn payer(missing_host: bool) -> Payer {
        Payer {
            id: "BCBS".into(),
            raw_name: "Blue Cross".into(),
            isa_sender_id: "BCBS".into(),
            sftp_host: if missing_host { None } else { Some("sftp.example.com".into()) },
            sftp_port: Some(22),
            sftp_username: Some("remit".into()),
            sftp_password_encrypted: Some("encrypted".into()),
            sftp_path: Some("/inbound".into()),
            created_by: "system".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn validate_sftp_config_passes_with_all_fields() {
        assert!(DeliveryEngine::validate_sftp_config(&payer(false)).is_ok());
    }

    #[test]
    fn validate_sftp_config_flags_missing_host() {
        let result = DeliveryEngine::validate_sftp_config(&payer(true));
        assert!(matches!(result, Err(ServiceError::ConfigurationMissing { .. })));
    }
}
