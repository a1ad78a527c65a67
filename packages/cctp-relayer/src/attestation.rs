//! Circle attestation (Iris) client

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use serde::Deserialize;
use std::time::Duration;

use crate::config::CircleConfig;
use crate::types::MessageState;

/// Attestation service response
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AttestationResponse {
    /// Hex attestation; `PENDING` or absent until the message is complete
    #[serde(default)]
    pub attestation: String,
    pub status: String,
}

impl AttestationResponse {
    pub fn is_complete(&self) -> bool {
        self.status.eq_ignore_ascii_case("complete")
    }
}

/// Source of attestations for observed messages
#[async_trait]
pub trait AttestationChecker: Send + Sync {
    /// `None` when no usable answer was obtained (transport error, non-200,
    /// malformed body). Absence of an attestation is never an error.
    async fn check(&self, msg: &MessageState) -> Option<AttestationResponse>;
}

/// HTTP client for Circle's attestation API
pub struct IrisClient {
    client: reqwest::Client,
    base_url: String,
}

impl IrisClient {
    pub fn new(config: &CircleConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .wrap_err("Failed to build attestation HTTP client")?;

        Ok(Self {
            client,
            base_url: config.attestation_base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn url_for(&self, iris_lookup_id: &str) -> String {
        format!("{}/0x{}", self.base_url, iris_lookup_id)
    }
}

#[async_trait]
impl AttestationChecker for IrisClient {
    async fn check(&self, msg: &MessageState) -> Option<AttestationResponse> {
        let url = self.url_for(&msg.iris_lookup_id);

        let response = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(
                    error = %e,
                    iris_lookup_id = %msg.iris_lookup_id,
                    "Attestation request failed"
                );
                return None;
            }
        };

        if !response.status().is_success() {
            tracing::debug!(
                status = %response.status(),
                iris_lookup_id = %msg.iris_lookup_id,
                "Attestation not available"
            );
            return None;
        }

        match response.json::<AttestationResponse>().await {
            Ok(body) => Some(body),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    iris_lookup_id = %msg.iris_lookup_id,
                    "Malformed attestation response"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn circle_config(base: &str) -> CircleConfig {
        CircleConfig {
            attestation_base_url: base.to_string(),
            fetch_retries: 1,
            fetch_retry_interval_secs: 1,
            request_timeout_secs: 1,
        }
    }

    #[test]
    fn test_url_for_adds_prefix() {
        let client = IrisClient::new(&circle_config("https://iris-api.circle.com/attestations/")).unwrap();
        assert_eq!(
            client.url_for("abcd"),
            "https://iris-api.circle.com/attestations/0xabcd"
        );
    }

    #[test]
    fn test_response_parsing() {
        let complete: AttestationResponse =
            serde_json::from_str(r#"{"attestation":"0xdead","status":"complete"}"#).unwrap();
        assert!(complete.is_complete());
        assert_eq!(complete.attestation, "0xdead");

        let pending: AttestationResponse =
            serde_json::from_str(r#"{"attestation":"PENDING","status":"pending_confirmations"}"#)
                .unwrap();
        assert!(!pending.is_complete());

        let bare: AttestationResponse = serde_json::from_str(r#"{"status":"pending"}"#).unwrap();
        assert!(bare.attestation.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_service_returns_none() {
        let client = IrisClient::new(&circle_config("http://127.0.0.1:1")).unwrap();
        let msg = crate::types::MessageState::from_message_bytes(
            "abc",
            &crate::types::test_utils::burn_message_bytes(0, 4, 1),
        )
        .unwrap();
        assert!(client.check(&msg).await.is_none());
    }
}
