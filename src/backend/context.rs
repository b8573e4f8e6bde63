//! The launch snapshot handed to a worker, and its transport envelope
//!
//! A [`JobContext`] is produced once by the execution service and consumed
//! once by the worker. On the wire it travels as a base64 JSON envelope,
//! either in clear or sealed with AES-256-GCM under a key derived from a
//! secret and a salt.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::worker::stop::MIN_CHECK_INTERVAL;

/// Environment variable carrying the sealed context when no file is used.
pub const CONTEXT_ENV: &str = "OPSFLOW_JOB_CONTEXT";
/// Environment variables a worker reads its decryption secret and salt from.
pub const CONTEXT_SECRET_ENV: &str = "OPSFLOW_CONTEXT_SECRET";
pub const CONTEXT_SALT_ENV: &str = "OPSFLOW_CONTEXT_SALT";

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Job context not found: {0}")]
    Missing(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed job context: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed job context encoding: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("Job context is encrypted but no key was configured")]
    KeyRequired,

    #[error("Job context could not be decrypted or encrypted: {0}")]
    Crypto(String),
}

/// Immutable snapshot a worker needs to run one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobContext {
    pub job_id: String,
    pub job_type: String,
    pub parameters: serde_json::Value,
    /// `<host>/<job id>`, stable for the lifetime of the worker.
    pub worker_id: String,
    /// Host that dispatched the job.
    pub dispatcher: String,
    /// Connection settings for whatever the job talks to.
    #[serde(default)]
    pub connection: HashMap<String, String>,
    /// The worker stops cooperatively once this file exists.
    pub stop_path: PathBuf,
    pub result_path: PathBuf,
    pub stop_check_interval_ms: u64,
    pub issued_at: DateTime<Utc>,
}

impl JobContext {
    pub fn stop_check_interval(&self) -> Duration {
        Duration::from_millis(self.stop_check_interval_ms).max(MIN_CHECK_INTERVAL)
    }
}

/// AES-256 key derived as SHA-256(secret || salt).
#[derive(Clone)]
pub struct ContextKey([u8; 32]);

impl ContextKey {
    pub fn derive(secret: &str, salt: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        hasher.update(salt.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&hasher.finalize());
        Self(key)
    }

    /// Read the secret and salt from the worker's environment, if set.
    pub fn from_env() -> Option<Self> {
        let secret = std::env::var(CONTEXT_SECRET_ENV).ok()?;
        let salt = std::env::var(CONTEXT_SALT_ENV).unwrap_or_default();
        Some(Self::derive(&secret, &salt))
    }
}

impl std::fmt::Debug for ContextKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ContextKey(..)")
    }
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
enum Envelope {
    Plain { context: JobContext },
    Aes256Gcm { nonce: String, ciphertext: String },
}

/// Seals and opens context envelopes.
#[derive(Debug, Clone, Default)]
pub struct ContextCodec {
    key: Option<ContextKey>,
}

impl ContextCodec {
    pub fn plain() -> Self {
        Self { key: None }
    }

    pub fn encrypted(key: ContextKey) -> Self {
        Self { key: Some(key) }
    }

    pub fn is_encrypted(&self) -> bool {
        self.key.is_some()
    }

    pub fn seal(&self, context: &JobContext) -> Result<String, ContextError> {
        let envelope = match &self.key {
            None => Envelope::Plain {
                context: context.clone(),
            },
            Some(key) => {
                let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));
                let mut nonce = [0u8; NONCE_LEN];
                rand::rng().fill(&mut nonce);
                let plaintext = serde_json::to_vec(context)?;
                let ciphertext = cipher
                    .encrypt(Nonce::from_slice(&nonce), plaintext.as_ref())
                    .map_err(|e| ContextError::Crypto(e.to_string()))?;
                Envelope::Aes256Gcm {
                    nonce: STANDARD.encode(nonce),
                    ciphertext: STANDARD.encode(ciphertext),
                }
            }
        };
        Ok(STANDARD.encode(serde_json::to_vec(&envelope)?))
    }

    pub fn open(&self, payload: &str) -> Result<JobContext, ContextError> {
        let raw = STANDARD.decode(payload.trim())?;
        match serde_json::from_slice::<Envelope>(&raw)? {
            Envelope::Plain { context } => Ok(context),
            Envelope::Aes256Gcm { nonce, ciphertext } => {
                let key = self.key.as_ref().ok_or(ContextError::KeyRequired)?;
                let nonce = STANDARD.decode(nonce)?;
                if nonce.len() != NONCE_LEN {
                    return Err(ContextError::Crypto(format!("nonce must be {NONCE_LEN} bytes")));
                }
                let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));
                let plaintext = cipher
                    .decrypt(Nonce::from_slice(&nonce), STANDARD.decode(ciphertext)?.as_ref())
                    .map_err(|e| ContextError::Crypto(e.to_string()))?;
                Ok(serde_json::from_slice(&plaintext)?)
            }
        }
    }
}

/// Where a worker finds its context.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextSource {
    File(PathBuf),
    Env,
}

impl ContextSource {
    /// Read and open the context. A context file is deleted once read.
    pub async fn load(&self, codec: &ContextCodec) -> Result<JobContext, ContextError> {
        match self {
            ContextSource::File(path) => {
                let payload = read_context_file(path).await?;
                let context = codec.open(&payload)?;
                tokio::fs::remove_file(path).await?;
                debug!(job_id = %context.job_id, file = ?path, "Consumed job context file");
                Ok(context)
            }
            ContextSource::Env => {
                let payload =
                    std::env::var(CONTEXT_ENV).map_err(|_| ContextError::Missing(CONTEXT_ENV.to_string()))?;
                codec.open(&payload)
            }
        }
    }
}

async fn read_context_file(path: &Path) -> Result<String, ContextError> {
    match tokio::fs::read_to_string(path).await {
        Ok(payload) => Ok(payload),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ContextError::Missing(path.display().to_string())),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
pub(crate) fn sample_context(job_id: &str) -> JobContext {
    JobContext {
        job_id: job_id.to_string(),
        job_type: "backfill".to_string(),
        parameters: serde_json::json!({ "table": "users", "batch": 500 }),
        worker_id: format!("host-a/{job_id}"),
        dispatcher: "host-a".to_string(),
        connection: HashMap::from([("dsn".to_string(), "postgres://db/app".to_string())]),
        stop_path: PathBuf::from(format!("/tmp/{job_id}.stop")),
        result_path: PathBuf::from(format!("/tmp/{job_id}.result.json")),
        stop_check_interval_ms: 250,
        issued_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn context() -> JobContext {
        sample_context("job-1")
    }

    #[test]
    fn test_encrypted_envelope_hides_parameters() {
        let codec = ContextCodec::encrypted(ContextKey::derive("s3cret", "salt"));
        let ctx = context();
        let sealed = codec.seal(&ctx).unwrap();

        let raw = String::from_utf8(STANDARD.decode(&sealed).unwrap()).unwrap();
        assert!(raw.contains("aes256_gcm"));
        assert!(!raw.contains("postgres://"));

        assert_eq!(codec.open(&sealed).unwrap(), ctx);
    }

    #[test]
    fn test_zero_stop_check_interval_is_raised() {
        let mut ctx = context();
        ctx.stop_check_interval_ms = 0;
        assert_eq!(ctx.stop_check_interval(), MIN_CHECK_INTERVAL);
    }

    #[test]
    fn test_wrong_key_cannot_open() {
        let sealed = ContextCodec::encrypted(ContextKey::derive("s3cret", "salt"))
            .seal(&context())
            .unwrap();

        let wrong_salt = ContextCodec::encrypted(ContextKey::derive("s3cret", "pepper"));
        assert!(matches!(wrong_salt.open(&sealed), Err(ContextError::Crypto(_))));
        assert!(matches!(ContextCodec::plain().open(&sealed), Err(ContextError::KeyRequired)));
    }

    #[test]
    fn test_same_context_seals_differently_each_time() {
        let codec = ContextCodec::encrypted(ContextKey::derive("s3cret", "salt"));
        let ctx = context();
        assert_ne!(codec.seal(&ctx).unwrap(), codec.seal(&ctx).unwrap());
    }

    #[tokio::test]
    async fn test_context_file_is_consumed_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("job-1.context");
        let codec = ContextCodec::plain();
        tokio::fs::write(&path, codec.seal(&context()).unwrap())
            .await
            .unwrap();

        let source = ContextSource::File(path.clone());
        let loaded = source.load(&codec).await.unwrap();
        assert_eq!(loaded.job_id, "job-1");
        assert!(!path.exists());

        assert!(matches!(source.load(&codec).await, Err(ContextError::Missing(_))));
    }
}
