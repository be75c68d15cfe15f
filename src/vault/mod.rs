//! On-chain vault program adapter
//!
//! Submit-and-confirm client for the lending vault program. Every call
//! carries the loan id as its correlation key, so a duplicate submission
//! cannot double-disburse or double-liquidate: the program rejects the
//! second attempt and this adapter reports that rejection as a confirmation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::retry::RetryPolicy;

/// Vault adapter errors
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// Submission or confirmation failed after bounded retries. Transient or
    /// permanent is for the caller's path to decide: a failed borrow cancels
    /// the loan, a failed liquidation is retried on the next scan.
    #[error("Chain call failed: {0}")]
    ChainCallFailed(String),
}

/// A confirmed on-chain transaction reference. Only constructed once the
/// vault program acknowledged the instruction, so holding one is proof of
/// confirmation, not of a mere attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxSignature(pub String);

impl std::fmt::Display for TxSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Narrow contract to the vault program
#[async_trait]
pub trait VaultGateway: Send + Sync {
    async fn initialize_vault(&self) -> Result<TxSignature, VaultError>;

    async fn deposit(&self, amount: i64, source_account: &str) -> Result<TxSignature, VaultError>;

    async fn borrow(
        &self,
        amount: i64,
        duration_seconds: i64,
        loan_id: Uuid,
    ) -> Result<TxSignature, VaultError>;

    async fn repay(&self, loan_id: Uuid, amount: i64) -> Result<TxSignature, VaultError>;

    async fn liquidate(&self, loan_id: Uuid) -> Result<TxSignature, VaultError>;
}

// ===== Vault RPC wire types =====

#[derive(Debug, Serialize)]
struct InstructionPayload {
    instruction: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    loan_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    amount: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_account: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    signature: String,
}

#[derive(Debug, Deserialize)]
struct ConfirmResponse {
    status: String,
    #[serde(default)]
    error: Option<String>,
}

/// reqwest-backed vault RPC client
pub struct VaultRpcClient {
    http: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
    confirm_timeout: Duration,
}

impl VaultRpcClient {
    pub fn new(base_url: String, call_timeout: Duration, retry: RetryPolicy) -> Self {
        let http = reqwest::Client::builder()
            .timeout(call_timeout)
            .build()
            .expect("failed to build HTTP client");

        Self {
            http,
            base_url,
            retry,
            confirm_timeout: call_timeout,
        }
    }

    /// The program rejects duplicate instructions for an already-processed
    /// loan id; that rejection means the original call landed.
    fn is_already_processed(error: &str) -> bool {
        let normalized = error.trim().to_ascii_lowercase();
        normalized.contains("already_processed")
            || normalized.contains("already processed")
            || normalized.contains("duplicate instruction")
    }

    async fn submit(&self, payload: &InstructionPayload) -> Result<String, VaultError> {
        let response = self
            .http
            .post(format!("{}/v1/instructions", self.base_url))
            .json(payload)
            .send()
            .await
            .map_err(|e| VaultError::ChainCallFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(VaultError::ChainCallFailed(format!(
                "instruction submit returned {}",
                response.status()
            )));
        }

        let submitted = response
            .json::<SubmitResponse>()
            .await
            .map_err(|e| VaultError::ChainCallFailed(e.to_string()))?;

        Ok(submitted.signature)
    }

    /// Poll the transaction until it confirms, fails, or the bounded
    /// confirmation window elapses.
    async fn confirm(&self, signature: &str) -> Result<TxSignature, VaultError> {
        let deadline = tokio::time::Instant::now() + self.confirm_timeout;

        loop {
            let response = self
                .http
                .get(format!("{}/v1/transactions/{}", self.base_url, signature))
                .send()
                .await
                .map_err(|e| VaultError::ChainCallFailed(e.to_string()))?;

            if response.status().is_success() {
                let confirm = response
                    .json::<ConfirmResponse>()
                    .await
                    .map_err(|e| VaultError::ChainCallFailed(e.to_string()))?;

                match confirm.status.trim().to_ascii_lowercase().as_str() {
                    "confirmed" => return Ok(TxSignature(signature.to_string())),
                    "failed" => {
                        let reason = confirm.error.unwrap_or_else(|| "unknown".to_string());
                        if Self::is_already_processed(&reason) {
                            return Ok(TxSignature(signature.to_string()));
                        }
                        return Err(VaultError::ChainCallFailed(reason));
                    }
                    // pending or processing, keep waiting
                    _ => {}
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(VaultError::ChainCallFailed(format!(
                    "confirmation timed out for {}",
                    signature
                )));
            }

            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    async fn submit_and_confirm(
        &self,
        payload: InstructionPayload,
    ) -> Result<TxSignature, VaultError> {
        let mut last_error = None;
        for attempt in 0..self.retry.max_attempts {
            let result = match self.submit(&payload).await {
                Ok(signature) => self.confirm(&signature).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(tx) => return Ok(tx),
                Err(e) => {
                    let delay = self.retry.delay(attempt);
                    tracing::warn!(
                        instruction = payload.instruction,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Vault call failed: {}",
                        e
                    );
                    last_error = Some(e);
                    if attempt + 1 < self.retry.max_attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| VaultError::ChainCallFailed("vault submission failed".to_string())))
    }
}

#[async_trait]
impl VaultGateway for VaultRpcClient {
    async fn initialize_vault(&self) -> Result<TxSignature, VaultError> {
        self.submit_and_confirm(InstructionPayload {
            instruction: "initialize_vault",
            loan_id: None,
            amount: None,
            duration_seconds: None,
            source_account: None,
        })
        .await
    }

    async fn deposit(&self, amount: i64, source_account: &str) -> Result<TxSignature, VaultError> {
        self.submit_and_confirm(InstructionPayload {
            instruction: "deposit",
            loan_id: None,
            amount: Some(amount),
            duration_seconds: None,
            source_account: Some(source_account.to_string()),
        })
        .await
    }

    async fn borrow(
        &self,
        amount: i64,
        duration_seconds: i64,
        loan_id: Uuid,
    ) -> Result<TxSignature, VaultError> {
        self.submit_and_confirm(InstructionPayload {
            instruction: "borrow",
            loan_id: Some(loan_id),
            amount: Some(amount),
            duration_seconds: Some(duration_seconds),
            source_account: None,
        })
        .await
    }

    async fn repay(&self, loan_id: Uuid, amount: i64) -> Result<TxSignature, VaultError> {
        self.submit_and_confirm(InstructionPayload {
            instruction: "repay",
            loan_id: Some(loan_id),
            amount: Some(amount),
            duration_seconds: None,
            source_account: None,
        })
        .await
    }

    async fn liquidate(&self, loan_id: Uuid) -> Result<TxSignature, VaultError> {
        self.submit_and_confirm(InstructionPayload {
            instruction: "liquidate",
            loan_id: Some(loan_id),
            duration_seconds: None,
            amount: None,
            source_account: None,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_processed_detection() {
        assert!(VaultRpcClient::is_already_processed("ALREADY_PROCESSED"));
        assert!(VaultRpcClient::is_already_processed(
            "loan already processed by program"
        ));
        assert!(VaultRpcClient::is_already_processed("Duplicate instruction"));
        assert!(!VaultRpcClient::is_already_processed("insufficient funds"));
    }
}
