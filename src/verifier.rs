//! Checking claimed payments against their challenge and the ledger.
//!
//! Verification reads only until everything checks out; the nonce is consumed
//! as the very last step. A payment that fails any check leaves its nonce
//! redeemable, so the client can correct the evidence (or top up) and retry
//! the same challenge until it expires.

use crate::errors::VerifyError;
use crate::ledger::Ledger;
use crate::nonce::NonceLedger;
use crate::types::VerifiedPayment;
use crate::utils::{addresses_match, current_timestamp_ms, is_plausible_tx_hash, normalize_tx_hash};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Allowed disagreement between the ledger's commit time and the local clock.
pub const CLOCK_SKEW_TOLERANCE: Duration = Duration::from_secs(60);

/// Decides whether a transaction hash pays for a challenge.
#[derive(Clone)]
pub struct PaymentVerifier {
    ledger: Arc<dyn Ledger>,
    nonces: NonceLedger,
    fallback: bool,
    retention: Duration,
    /// Accepted transaction hashes and when they may be forgotten.
    spent: Arc<RwLock<HashMap<String, i64>>>,
}

impl PaymentVerifier {
    /// Creates a verifier.
    ///
    /// `nonce_ttl` bounds how long accepted transaction hashes are remembered:
    /// a transaction can only satisfy challenges issued before it committed,
    /// and all of those expire within one TTL.
    pub fn new(ledger: Arc<dyn Ledger>, nonces: NonceLedger, fallback: bool, nonce_ttl: Duration) -> Self {
        Self {
            ledger,
            nonces,
            fallback,
            retention: nonce_ttl + CLOCK_SKEW_TOLERANCE,
            spent: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Whether evidence is accepted on format alone.
    pub fn is_fallback(&self) -> bool {
        self.fallback
    }

    /// Verifies that `tx_ref` pays at least `expected_amount` octas for the
    /// challenge identified by `nonce_token`, consuming the nonce on success.
    pub async fn verify(
        &self,
        tx_ref: &str,
        nonce_token: &str,
        expected_amount: u128,
    ) -> Result<VerifiedPayment, VerifyError> {
        let tx_ref = tx_ref.trim();
        if !is_plausible_tx_hash(tx_ref) {
            return Err(VerifyError::MalformedEvidence(format!(
                "'{}' is not a 32-byte hex transaction hash",
                tx_ref
            )));
        }
        let hash = normalize_tx_hash(tx_ref);

        if self.fallback {
            tracing::warn!(
                mode = "fallback",
                tx_hash = %hash,
                "payment accepted without ledger verification"
            );
            return Ok(VerifiedPayment {
                payer: None,
                amount: None,
                tx_ref: hash,
                fallback: true,
            });
        }

        let terms = self.nonces.validate(nonce_token).await?;
        if self.spent.read().await.contains_key(&hash) {
            return Err(VerifyError::TransactionReused(hash));
        }

        let txn = self
            .ledger
            .transaction_by_hash(&hash)
            .await
            .map_err(|e| VerifyError::LedgerUnavailable(e.to_string()))?
            .ok_or_else(|| VerifyError::TransactionNotFound(hash.clone()))?;

        if txn.is_pending() {
            return Err(VerifyError::TransactionPending(hash));
        }
        if !txn.is_success() {
            return Err(VerifyError::TransactionFailed(
                txn.vm_status.clone().unwrap_or_else(|| "unknown vm status".to_string()),
            ));
        }
        if let Some(committed_at) = txn.timestamp_ms() {
            if committed_at + (CLOCK_SKEW_TOLERANCE.as_millis() as i64) < terms.issued_at {
                return Err(VerifyError::TransactionReused(hash));
            }
        }

        let transfer = txn
            .transfer_to(&terms.recipient)
            .ok_or_else(|| VerifyError::MalformedEvidence(format!("transaction {} carries no APT transfer", hash)))?;
        if !addresses_match(&transfer.recipient, &terms.recipient) {
            return Err(VerifyError::RecipientMismatch {
                expected: terms.recipient,
                actual: transfer.recipient,
            });
        }
        if transfer.amount < expected_amount {
            return Err(VerifyError::AmountTooLow {
                required: expected_amount,
                actual: transfer.amount,
            });
        }

        self.claim(&hash, nonce_token).await?;

        tracing::info!(
            mode = "strict",
            tx_hash = %hash,
            payer = txn.sender.as_deref().unwrap_or(""),
            amount = %transfer.amount,
            "payment verified"
        );
        Ok(VerifiedPayment {
            payer: txn.sender,
            amount: Some(transfer.amount),
            tx_ref: hash,
            fallback: false,
        })
    }

    /// Atomically records the hash as spent and consumes the nonce.
    async fn claim(&self, hash: &str, nonce_token: &str) -> Result<(), VerifyError> {
        let now = current_timestamp_ms();
        let mut spent = self.spent.write().await;
        spent.retain(|_, forget_at| *forget_at > now);
        if spent.contains_key(hash) {
            return Err(VerifyError::TransactionReused(hash.to_string()));
        }

        self.nonces.consume(nonce_token).await?;
        spent.insert(hash.to_string(), now + self.retention.as_millis() as i64);
        Ok(())
    }
}
