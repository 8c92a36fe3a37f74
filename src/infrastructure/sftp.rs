//! SFTP delivery boundary.
//!
//! Trait-based exactly like `infrastructure::storage::StorageBackend` in the
//! source codebase: one real network-backed implementation, one in-memory
//! implementation for tests, selected behind `Arc<dyn SftpClient>`.

use std::io::Write as _;
use std::net::TcpStream;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::models::Payer;

#[derive(Debug, Error)]
pub enum SftpError {
    #[error("sftp configuration missing for payer {0}")]
    ConfigurationMissing(String),
    #[error("sftp connection failed: {0}")]
    Connection(String),
    #[error("sftp transfer failed: {0}")]
    Transfer(String),
}

#[async_trait]
pub trait SftpClient: Send + Sync {
    /// Uploads `content` to `remote_file_name` under the payer's configured
    /// path. Returns once the remote write has been flushed and the session
    /// closed, matching the source's `StorageBackend::put` contract.
    async fn put(&self, payer: &Payer, remote_file_name: &str, content: &[u8]) -> Result<(), SftpError>;
}

/// Production implementation backed by `ssh2`. Blocking I/O is pushed onto
/// `spawn_blocking` since `ssh2::Session` has no async story, mirroring how
/// the source's `LocalStorage` wraps blocking `std::fs` calls for an async
/// trait method.
pub struct Ssh2SftpClient;

#[async_trait]
impl SftpClient for Ssh2SftpClient {
    async fn put(&self, payer: &Payer, remote_file_name: &str, content: &[u8]) -> Result<(), SftpError> {
        let host = payer
            .sftp_host
            .clone()
            .ok_or_else(|| SftpError::ConfigurationMissing(payer.id.clone()))?;
        let port = payer.sftp_port.unwrap_or(22);
        let username = payer
            .sftp_username
            .clone()
            .ok_or_else(|| SftpError::ConfigurationMissing(payer.id.clone()))?;
        let password = payer
            .sftp_password_encrypted
            .clone()
            .ok_or_else(|| SftpError::ConfigurationMissing(payer.id.clone()))?;
        let remote_path = format!(
            "{}/{}",
            payer.sftp_path.clone().unwrap_or_default().trim_end_matches('/'),
            remote_file_name
        );
        let content = content.to_vec();

        tokio::task::spawn_blocking(move || -> Result<(), SftpError> {
            let tcp = TcpStream::connect((host.as_str(), port as u16))
                .map_err(|e| SftpError::Connection(e.to_string()))?;
            let mut session = ssh2::Session::new().map_err(|e| SftpError::Connection(e.to_string()))?;
            session.set_tcp_stream(tcp);
            session
                .handshake()
                .map_err(|e| SftpError::Connection(e.to_string()))?;
            session
                .userauth_password(&username, &password)
                .map_err(|e| SftpError::Connection(e.to_string()))?;
            if !session.authenticated() {
                return Err(SftpError::Connection("authentication rejected".into()));
            }

            let sftp = session.sftp().map_err(|e| SftpError::Connection(e.to_string()))?;
            let mut remote = sftp
                .create(std::path::Path::new(&remote_path))
                .map_err(|e| SftpError::Transfer(e.to_string()))?;
            remote
                .write_all(&content)
                .map_err(|e| SftpError::Transfer(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| SftpError::Transfer(e.to_string()))?
    }
}

/// Captures uploads in memory for use by integration tests, the same role
/// `MemoryStorage` plays for `StorageBackend` in the source.
#[derive(Default)]
pub struct InMemorySftpClient {
    uploads: Mutex<Vec<(String, String, Vec<u8>)>>,
}

impl InMemorySftpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uploads(&self) -> Vec<(String, String, Vec<u8>)> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl SftpClient for InMemorySftpClient {
    async fn put(&self, payer: &Payer, remote_file_name: &str, content: &[u8]) -> Result<(), SftpError> {
        self.uploads
            .lock()
            .unwrap()
            .push((payer.id.clone(), remote_file_name.to_string(), content.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn payer() -> Payer {
        Payer {
            id: "BCBS".into(),
            raw_name: "Blue Cross".into(),
            isa_sender_id: "BCBS".into(),
            sftp_host: Some("sftp.example.com".into()),
            sftp_port: Some(22),
            sftp_username: Some("remit".into()),
            sftp_password_encrypted: Some("secret".into()),
            sftp_path: Some("/inbound".into()),
            created_by: "system".into(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn in_memory_client_records_uploads() {
        let client = InMemorySftpClient::new();
        client.put(&payer(), "remit_001.835", b"ISA*00*...").await.unwrap();
        let uploads = client.uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].0, "BCBS");
        assert_eq!(uploads[0].1, "remit_001.835");
    }
}
