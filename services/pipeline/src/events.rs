//! Friend link event schemas.
//!
//! Both events are published as JSON with the friend code as the record key,
//! so uploads and clicks for the same link share a partition number.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest expiry timestamp representable in a 16-digit zero-padded key.
pub const MAX_EXPIRY_MILLIS: i64 = 9_999_999_999_999_999;

/// Errors raised while decoding or validating an event payload
#[derive(Error, Debug)]
pub enum EventError {
    #[error("Failed to deserialize event: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid event field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// A friend link was created for an uploaded file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadEvent {
    /// Link identifier
    pub friend_code: String,
    /// Object key of the uploaded file
    #[serde(rename = "s3FileKey")]
    pub storage_key: String,
    /// Creation time, epoch milliseconds
    pub created_at: i64,
    /// Expiry time, epoch milliseconds
    #[serde(rename = "expiredAt")]
    pub expires_at: i64,
}

impl UploadEvent {
    pub fn new(
        friend_code: impl Into<String>,
        storage_key: impl Into<String>,
        created_at: i64,
        expires_at: i64,
    ) -> Self {
        Self {
            friend_code: friend_code.into(),
            storage_key: storage_key.into(),
            created_at,
            expires_at,
        }
    }

    /// Decode and validate a JSON payload
    pub fn decode(payload: &[u8]) -> Result<Self, EventError> {
        let event: Self = serde_json::from_slice(payload)?;
        event.validate()?;
        Ok(event)
    }

    pub fn validate(&self) -> Result<(), EventError> {
        require_non_empty("friendCode", &self.friend_code)?;
        require_non_empty("s3FileKey", &self.storage_key)?;

        if !(0..=MAX_EXPIRY_MILLIS).contains(&self.expires_at) {
            return Err(EventError::InvalidField {
                field: "expiredAt",
                reason: format!(
                    "{} outside 0..={}",
                    self.expires_at, MAX_EXPIRY_MILLIS
                ),
            });
        }

        Ok(())
    }
}

/// A friend link was opened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickEvent {
    /// Link identifier
    pub friend_code: String,
    /// Click time, epoch milliseconds
    pub clicked_at: i64,
}

impl ClickEvent {
    pub fn new(friend_code: impl Into<String>, clicked_at: i64) -> Self {
        Self {
            friend_code: friend_code.into(),
            clicked_at,
        }
    }

    /// Decode and validate a JSON payload
    pub fn decode(payload: &[u8]) -> Result<Self, EventError> {
        let event: Self = serde_json::from_slice(payload)?;
        require_non_empty("friendCode", &event.friend_code)?;
        Ok(event)
    }
}

fn require_non_empty(field: &'static str, value: &str) -> Result<(), EventError> {
    if value.trim().is_empty() {
        return Err(EventError::InvalidField {
            field,
            reason: "must not be empty".to_string(),
        });
    }
    Ok(())
}
