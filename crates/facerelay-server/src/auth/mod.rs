//! Device credential checks
//!
//! Devices authenticate with an identifier and a shared secret; the directory
//! stores an argon2 hash of the secret.

use crate::directory::{DeviceRecord, Directory};
use crate::error::AppError;
use crate::relay::AdmissionError;
use argon2::{
    password_hash::{rand_core::OsRng, SaltString},
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
};
use axum::{extract::FromRequestParts, http::request::Parts};
use std::sync::Arc;

pub const DEVICE_ID_HEADER: &str = "x-device-id";
pub const DEVICE_SECRET_HEADER: &str = "x-device-secret";

/// Hash a device secret for storage
pub fn hash_secret(secret: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Secret hashing failed: {}", e))?
        .to_string();
    Ok(hash)
}

pub fn verify_secret(secret: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(secret.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            tracing::warn!("Stored device secret hash is malformed: {}", e);
            false
        }
    }
}

/// Validates device credentials against the directory
#[derive(Clone)]
pub struct DeviceAuthenticator {
    directory: Arc<dyn Directory>,
}

impl DeviceAuthenticator {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self { directory }
    }

    /// Check the device exists, the secret matches, and the device is approved.
    /// Device class is left to the caller.
    pub async fn authenticate(
        &self,
        device_id: &str,
        secret: &str,
    ) -> Result<DeviceRecord, AdmissionError> {
        let record = self
            .directory
            .device(device_id)
            .await?
            .ok_or(AdmissionError::UnknownDevice)?;

        // Argon2 is deliberately slow; keep it off the async workers
        let secret = secret.to_string();
        let hash = record.secret_hash.clone();
        let matches = tokio::task::spawn_blocking(move || verify_secret(&secret, &hash))
            .await
            .unwrap_or_else(|e| {
                tracing::error!("Credential check task failed: {}", e);
                false
            });

        if !matches {
            return Err(AdmissionError::BadCredential);
        }

        if !record.approved {
            return Err(AdmissionError::NotApproved);
        }

        Ok(record)
    }
}

/// Extractor for the device identity headers on the media session endpoint
#[derive(Debug, Clone)]
pub struct DeviceCredentials {
    pub device_id: String,
    pub secret: String,
}

impl<S> FromRequestParts<S> for DeviceCredentials
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(String::from)
        };

        match (header(DEVICE_ID_HEADER), header(DEVICE_SECRET_HEADER)) {
            (Some(device_id), Some(secret)) => Ok(DeviceCredentials { device_id, secret }),
            _ => Err(AppError::Unauthorized),
        }
    }
}
