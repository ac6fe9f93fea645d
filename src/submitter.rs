//! Serialized transaction submission from the server's signing identity.
//!
//! An account's sequence number only moves forward one committed transaction
//! at a time, so every submission from the single signing key goes through
//! one async mutex: build, sign, broadcast and settle complete before the
//! next caller may fetch a sequence number. After each submission the next
//! one additionally waits out a minimum spacing so residual mempool state
//! can drain.
//!
//! Within one submission, sequence-number races, mempool conflicts and
//! ambiguous settlement timeouts are retried with a freshly built
//! transaction. Anything else fails immediately. Callers always receive a
//! [`TransactionResult`], never an error.

use crate::config::SubmitterConfig;
use crate::errors::{Result, X402Error};
use crate::ledger::{Ledger, LedgerTransaction, SignedTransaction, TransactionSignature, UnsignedTransaction};
use crate::signer::SigningIdentity;
use crate::types::{EntryFunctionPayload, TransactionResult};
use crate::utils::normalize_address;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tokio::time::Instant;

/// Resource holding an account's APT balance.
pub const APT_COIN_STORE: &str = "0x1::coin::CoinStore<0x1::aptos_coin::AptosCoin>";

/// How a failed attempt should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The sequence number was already used
    SequenceTooOld,
    /// The sequence number is ahead of the account
    SequenceTooNew,
    /// The mempool already holds a transaction for this sequence number, or is full
    MempoolConflict,
    /// Broadcast or settlement did not finish in time; the transaction may still land
    Timeout,
    /// Not retryable
    Fatal,
}

impl FailureKind {
    /// Classifies a ledger error.
    pub fn classify(err: &X402Error) -> Self {
        match err {
            X402Error::TimeoutExceeded => return FailureKind::Timeout,
            X402Error::HttpError(e) if e.is_timeout() => return FailureKind::Timeout,
            _ => {}
        }

        let vm_error = match err {
            X402Error::LedgerApi { vm_error, .. } => vm_error.as_deref(),
            _ => None,
        };
        let text = err.to_string().to_ascii_uppercase();
        let code = match err {
            X402Error::LedgerApi { error_code, .. } => error_code.as_deref().unwrap_or("").to_ascii_uppercase(),
            _ => String::new(),
        };

        if text.contains("SEQUENCE_NUMBER_TOO_OLD") || vm_error == Some("3") {
            FailureKind::SequenceTooOld
        } else if text.contains("SEQUENCE_NUMBER_TOO_NEW") || vm_error == Some("4") {
            FailureKind::SequenceTooNew
        } else if text.contains("ALREADY IN MEMPOOL")
            || code.contains("MEMPOOL")
            || text.contains("MEMPOOL_IS_FULL")
        {
            FailureKind::MempoolConflict
        } else {
            FailureKind::Fatal
        }
    }

    fn is_retryable(self) -> bool {
        self != FailureKind::Fatal
    }
}

struct AttemptFailure {
    kind: FailureKind,
    message: String,
}

impl From<X402Error> for AttemptFailure {
    fn from(err: X402Error) -> Self {
        Self {
            kind: FailureKind::classify(&err),
            message: err.to_string(),
        }
    }
}

/// Submits transactions signed by the server's single identity, one at a time.
pub struct TransactionSubmitter {
    ledger: Arc<dyn Ledger>,
    private_key: Option<String>,
    identity: OnceCell<SigningIdentity>,
    config: SubmitterConfig,
    /// Held for the whole of a submission; records when the last one ended.
    last_completed: Mutex<Option<Instant>>,
}

impl TransactionSubmitter {
    /// Creates a submitter. The key is parsed on first use.
    pub fn new(ledger: Arc<dyn Ledger>, private_key: Option<String>, config: SubmitterConfig) -> Self {
        Self {
            ledger,
            private_key,
            identity: OnceCell::new(),
            config,
            last_completed: Mutex::new(None),
        }
    }

    async fn identity(&self) -> Result<&SigningIdentity> {
        self.identity
            .get_or_try_init(|| async {
                let key = self
                    .private_key
                    .as_deref()
                    .ok_or_else(|| X402Error::ConfigError("no signing key configured".to_string()))?;
                let identity = SigningIdentity::from_hex(key)?;
                tracing::info!(address = identity.address(), "loaded signing identity");
                Ok(identity)
            })
            .await
    }

    /// Address of the signing identity.
    pub async fn address(&self) -> Result<String> {
        Ok(self.identity().await?.address().to_string())
    }

    /// APT balance of the signing identity, in octas.
    pub async fn balance(&self) -> Result<u128> {
        let address = self.address().await?;
        let Some(resource) = self.ledger.account_resource(&address, APT_COIN_STORE).await? else {
            return Ok(0);
        };

        resource
            .pointer("/data/coin/value")
            .and_then(|v| v.as_str())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| X402Error::LedgerError("unexpected CoinStore layout".to_string()))
    }

    /// Transfers `amount` octas of APT to `recipient`.
    pub async fn transfer(&self, recipient: &str, amount: u128) -> TransactionResult {
        match normalize_address(recipient) {
            Ok(recipient) => self.submit(EntryFunctionPayload::apt_transfer(&recipient, amount)).await,
            Err(e) => TransactionResult::failed("", e.to_string()),
        }
    }

    /// Signs, broadcasts and waits for `payload`, serialized with every other submission.
    pub async fn submit(&self, payload: EntryFunctionPayload) -> TransactionResult {
        let mut last_completed = self.last_completed.lock().await;
        if let Some(done) = *last_completed {
            let ready = done + self.config.min_spacing;
            if Instant::now() < ready {
                tracing::debug!(wait_ms = (ready - Instant::now()).as_millis() as u64, "spacing submissions");
                tokio::time::sleep_until(ready).await;
            }
        }

        let result = self.submit_with_retries(&payload).await;
        *last_completed = Some(Instant::now());

        if result.success {
            tracing::info!(hash = %result.hash, function = %payload.function, "transaction committed");
        } else {
            tracing::error!(
                hash = %result.hash,
                function = %payload.function,
                error = result.error.as_deref().unwrap_or(""),
                vm_status = result.vm_status.as_deref().unwrap_or(""),
                "transaction failed"
            );
        }
        result
    }

    async fn submit_with_retries(&self, payload: &EntryFunctionPayload) -> TransactionResult {
        let identity = match self.identity().await {
            Ok(identity) => identity,
            Err(e) => return TransactionResult::failed("", e.to_string()),
        };

        // Broadcast by an earlier attempt but not seen settled.
        let mut outstanding: Option<String> = None;
        let mut last_error = String::new();

        for attempt in 1..=self.config.max_attempts {
            if let Some(hash) = &outstanding {
                if let Ok(Some(txn)) = self.ledger.transaction_by_hash(hash).await {
                    if !txn.is_pending() {
                        tracing::info!(hash = %hash, "earlier attempt settled while retrying");
                        return settled_result(txn);
                    }
                }
            }

            match self.attempt(identity, payload, &mut outstanding).await {
                Ok(result) => return result,
                Err(failure) if !failure.kind.is_retryable() => {
                    return TransactionResult::failed(outstanding.unwrap_or_default(), failure.message);
                }
                Err(failure) => {
                    tracing::warn!(
                        attempt,
                        max_attempts = self.config.max_attempts,
                        kind = ?failure.kind,
                        error = %failure.message,
                        "retryable submission failure"
                    );
                    last_error = failure.message;
                    if attempt < self.config.max_attempts {
                        tokio::time::sleep(self.backoff(failure.kind)).await;
                    }
                }
            }
        }

        TransactionResult::failed(
            outstanding.unwrap_or_default(),
            format!("gave up after {} attempts: {}", self.config.max_attempts, last_error),
        )
    }

    async fn attempt(
        &self,
        identity: &SigningIdentity,
        payload: &EntryFunctionPayload,
        outstanding: &mut Option<String>,
    ) -> std::result::Result<TransactionResult, AttemptFailure> {
        let sequence_number = self.ledger.sequence_number(identity.address()).await?;
        let expiration = chrono::Utc::now().timestamp() as u64 + self.config.expiration.as_secs();

        let transaction = UnsignedTransaction {
            sender: identity.address().to_string(),
            sequence_number: sequence_number.to_string(),
            max_gas_amount: self.config.max_gas_amount.to_string(),
            gas_unit_price: self.config.gas_unit_price.to_string(),
            expiration_timestamp_secs: expiration.to_string(),
            payload: payload.clone(),
        };
        let message = self.ledger.encode_submission(&transaction).await?;
        let signed = SignedTransaction {
            transaction,
            signature: TransactionSignature {
                signature_type: "ed25519_signature".to_string(),
                public_key: identity.public_key_hex(),
                signature: identity.sign(&message),
            },
        };

        let hash = self.ledger.submit_transaction(&signed).await?;
        tracing::debug!(hash = %hash, sequence_number, "transaction broadcast");
        *outstanding = Some(hash.clone());

        let settled = self.wait_for_settlement(&hash).await?;
        Ok(settled_result(settled))
    }

    /// Polls until the transaction leaves the mempool, bounded by the settlement timeout.
    async fn wait_for_settlement(&self, hash: &str) -> Result<LedgerTransaction> {
        let poll = async {
            loop {
                match self.ledger.transaction_by_hash(hash).await {
                    Ok(Some(txn)) if !txn.is_pending() => return txn,
                    Ok(_) => {}
                    Err(e) => tracing::debug!(hash, error = %e, "settlement poll failed"),
                }
                tokio::time::sleep(self.config.poll_interval).await;
            }
        };

        tokio::time::timeout(self.config.settlement_timeout, poll)
            .await
            .map_err(|_| X402Error::TimeoutExceeded)
    }

    fn backoff(&self, kind: FailureKind) -> Duration {
        match kind {
            FailureKind::SequenceTooOld | FailureKind::SequenceTooNew => self.config.sequence_backoff,
            FailureKind::MempoolConflict | FailureKind::Timeout => self.config.mempool_backoff,
            FailureKind::Fatal => Duration::ZERO,
        }
    }
}

fn settled_result(txn: LedgerTransaction) -> TransactionResult {
    let success = txn.is_success();
    TransactionResult {
        gas_used: txn.gas_used_units(),
        error: if success { None } else { txn.vm_status.clone() },
        vm_status: txn.vm_status,
        hash: txn.hash,
        success,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    const KEY: &str = "0x9bf49a6a0755f953811fce125f2683d50429c3bb49e074147e0089a52eae155f";

    /// Scripted ledger: each broadcast pops the next outcome.
    #[derive(Default)]
    struct ScriptedLedger {
        sequence: StdMutex<u64>,
        broadcasts: StdMutex<VecDeque<Outcome>>,
        submitted: StdMutex<Vec<String>>,
        settled: StdMutex<Vec<(String, bool)>>,
        sequence_fetches: StdMutex<Vec<Instant>>,
    }

    enum Outcome {
        Commit,
        Abort,
        Reject(X402Error),
        NeverSettles,
    }

    impl ScriptedLedger {
        fn with(outcomes: Vec<Outcome>) -> Arc<Self> {
            Arc::new(Self {
                broadcasts: StdMutex::new(outcomes.into()),
                ..Default::default()
            })
        }
    }

    fn api_error(message: &str, error_code: &str) -> X402Error {
        X402Error::LedgerApi {
            status: 400,
            error_code: Some(error_code.to_string()),
            vm_error: None,
            message: message.to_string(),
        }
    }

    #[async_trait]
    impl Ledger for ScriptedLedger {
        async fn sequence_number(&self, _address: &str) -> Result<u64> {
            self.sequence_fetches.lock().unwrap().push(Instant::now());
            Ok(*self.sequence.lock().unwrap())
        }

        async fn account_resource(&self, _address: &str, _resource_type: &str) -> Result<Option<Value>> {
            Ok(Some(json!({"type": APT_COIN_STORE, "data": {"coin": {"value": "12345"}}})))
        }

        async fn encode_submission(&self, transaction: &UnsignedTransaction) -> Result<Vec<u8>> {
            Ok(serde_json::to_vec(transaction)?)
        }

        async fn submit_transaction(&self, transaction: &SignedTransaction) -> Result<String> {
            let outcome = self.broadcasts.lock().unwrap().pop_front().unwrap_or(Outcome::Commit);
            let hash = format!("0x{:064x}", self.submitted.lock().unwrap().len() + 1);
            match outcome {
                Outcome::Reject(err) => return Err(err),
                Outcome::Commit => {
                    *self.sequence.lock().unwrap() += 1;
                    self.settled.lock().unwrap().push((hash.clone(), true));
                }
                Outcome::Abort => {
                    *self.sequence.lock().unwrap() += 1;
                    self.settled.lock().unwrap().push((hash.clone(), false));
                }
                Outcome::NeverSettles => {}
            }
            assert_eq!(transaction.signature.signature_type, "ed25519_signature");
            self.submitted.lock().unwrap().push(hash.clone());
            Ok(hash)
        }

        async fn transaction_by_hash(&self, hash: &str) -> Result<Option<LedgerTransaction>> {
            let settled = self.settled.lock().unwrap();
            let txn = match settled.iter().find(|(h, _)| h == hash) {
                Some((_, true)) => json!({"type": "user_transaction", "hash": hash, "success": true,
                    "vm_status": "Executed successfully", "gas_used": "9"}),
                Some((_, false)) => json!({"type": "user_transaction", "hash": hash, "success": false,
                    "vm_status": "Move abort in 0x1::coin: EINSUFFICIENT_BALANCE(0x10006)", "gas_used": "4"}),
                None if self.submitted.lock().unwrap().iter().any(|h| h == hash) => {
                    json!({"type": "pending_transaction", "hash": hash})
                }
                None => return Ok(None),
            };
            Ok(Some(serde_json::from_value(txn)?))
        }
    }

    fn fast_config() -> SubmitterConfig {
        SubmitterConfig {
            min_spacing: Duration::from_secs(5),
            sequence_backoff: Duration::from_secs(1),
            mempool_backoff: Duration::from_secs(10),
            settlement_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            ..SubmitterConfig::default()
        }
    }

    fn submitter(ledger: Arc<ScriptedLedger>) -> Arc<TransactionSubmitter> {
        Arc::new(TransactionSubmitter::new(ledger, Some(KEY.to_string()), fast_config()))
    }

    #[test]
    fn test_classification() {
        let too_old = api_error(
            "Invalid transaction: Type: Validation Code: SEQUENCE_NUMBER_TOO_OLD",
            "vm_error",
        );
        assert_eq!(FailureKind::classify(&too_old), FailureKind::SequenceTooOld);

        let too_new = X402Error::LedgerApi {
            status: 400,
            error_code: Some("vm_error".into()),
            vm_error: Some("4".into()),
            message: "Invalid transaction".into(),
        };
        assert_eq!(FailureKind::classify(&too_new), FailureKind::SequenceTooNew);

        let mempool = api_error("Transaction already in mempool with a different payload", "invalid_input");
        assert_eq!(FailureKind::classify(&mempool), FailureKind::MempoolConflict);
        let full = api_error("Mempool is full", "mempool_is_full");
        assert_eq!(FailureKind::classify(&full), FailureKind::MempoolConflict);

        assert_eq!(FailureKind::classify(&X402Error::TimeoutExceeded), FailureKind::Timeout);

        let balance = api_error(
            "Invalid transaction: Type: Validation Code: INSUFFICIENT_BALANCE_FOR_TRANSACTION_FEE",
            "vm_error",
        );
        assert_eq!(FailureKind::classify(&balance), FailureKind::Fatal);
        let signature = api_error("Invalid transaction: Type: Validation Code: INVALID_SIGNATURE", "vm_error");
        assert_eq!(FailureKind::classify(&signature), FailureKind::Fatal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_submission() {
        let ledger = ScriptedLedger::with(vec![Outcome::Commit]);
        let submitter = submitter(ledger.clone());

        let result = submitter.transfer("0xbeef", 100_000).await;
        assert!(result.success, "{result:?}");
        assert_eq!(result.gas_used, Some(9));
        assert!(!result.hash.is_empty());
        assert!(result.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_race_is_retried() {
        let ledger = ScriptedLedger::with(vec![
            Outcome::Reject(api_error("SEQUENCE_NUMBER_TOO_OLD", "vm_error")),
            Outcome::Commit,
        ]);
        let submitter = submitter(ledger.clone());

        let start = Instant::now();
        let result = submitter.transfer("0xbeef", 1).await;
        assert!(result.success);
        assert_eq!(ledger.sequence_fetches.lock().unwrap().len(), 2);
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mempool_conflict_uses_long_cooldown() {
        let ledger = ScriptedLedger::with(vec![
            Outcome::Reject(api_error("Transaction already in mempool", "invalid_input")),
            Outcome::Commit,
        ]);
        let submitter = submitter(ledger);

        let start = Instant::now();
        assert!(submitter.transfer("0xbeef", 1).await.success);
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_aborts_immediately() {
        let ledger = ScriptedLedger::with(vec![Outcome::Reject(api_error(
            "INSUFFICIENT_BALANCE_FOR_TRANSACTION_FEE",
            "vm_error",
        ))]);
        let submitter = submitter(ledger.clone());

        let result = submitter.transfer("0xbeef", 1).await;
        assert!(!result.success);
        assert_eq!(result.hash, "");
        assert!(result.error.unwrap().contains("INSUFFICIENT_BALANCE"));
        assert_eq!(ledger.sequence_fetches.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhausted() {
        let ledger = ScriptedLedger::with(vec![
            Outcome::Reject(api_error("SEQUENCE_NUMBER_TOO_NEW", "vm_error")),
            Outcome::Reject(api_error("SEQUENCE_NUMBER_TOO_NEW", "vm_error")),
            Outcome::Reject(api_error("SEQUENCE_NUMBER_TOO_NEW", "vm_error")),
        ]);
        let submitter = submitter(ledger.clone());

        let result = submitter.transfer("0xbeef", 1).await;
        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(error.contains("gave up after 3 attempts"), "{error}");
        assert!(error.contains("SEQUENCE_NUMBER_TOO_NEW"));
        assert_eq!(ledger.sequence_fetches.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_committed_abort_is_not_retried() {
        let ledger = ScriptedLedger::with(vec![Outcome::Abort]);
        let submitter = submitter(ledger.clone());

        let result = submitter.transfer("0xbeef", 1).await;
        assert!(!result.success);
        assert!(!result.hash.is_empty());
        assert!(result.vm_status.unwrap().contains("EINSUFFICIENT_BALANCE"));
        assert_eq!(ledger.submitted.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settlement_timeout_gives_up_with_hash() {
        let ledger = ScriptedLedger::with(vec![
            Outcome::NeverSettles,
            Outcome::NeverSettles,
            Outcome::NeverSettles,
        ]);
        let submitter = submitter(ledger.clone());

        let result = submitter.transfer("0xbeef", 1).await;
        assert!(!result.success);
        assert!(!result.hash.is_empty());
        assert!(result.error.unwrap().contains("Timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_settlement_is_picked_up_instead_of_resending() {
        let ledger = ScriptedLedger::with(vec![Outcome::NeverSettles]);
        let submitter = submitter(ledger.clone());

        let task = {
            let submitter = submitter.clone();
            tokio::spawn(async move { submitter.transfer("0xbeef", 1).await })
        };

        // let the first attempt time out, then settle it during the cooldown
        tokio::time::sleep(Duration::from_secs(35)).await;
        let first = ledger.submitted.lock().unwrap()[0].clone();
        ledger.settled.lock().unwrap().push((first.clone(), true));

        let result = task.await.unwrap();
        assert!(result.success);
        assert_eq!(result.hash, first);
        assert_eq!(ledger.submitted.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_back_to_back_submissions_are_serialized() {
        let ledger = ScriptedLedger::with(vec![Outcome::Commit, Outcome::Commit]);
        let submitter = submitter(ledger.clone());

        let a = tokio::spawn({
            let submitter = submitter.clone();
            async move { submitter.transfer("0xbeef", 1).await }
        });
        let b = tokio::spawn({
            let submitter = submitter.clone();
            async move { submitter.transfer("0xbeef", 2).await }
        });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(a.success && b.success);
        assert_ne!(a.hash, b.hash);

        let fetches = ledger.sequence_fetches.lock().unwrap().clone();
        assert_eq!(fetches.len(), 2);
        assert!(fetches[1] - fetches[0] >= Duration::from_secs(5));
        assert_eq!(*ledger.sequence.lock().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_key_fails_without_broadcast() {
        let ledger = ScriptedLedger::with(vec![]);
        let submitter = TransactionSubmitter::new(ledger.clone(), None, fast_config());

        let result = submitter.transfer("0xbeef", 1).await;
        assert!(!result.success);
        assert!(ledger.submitted.lock().unwrap().is_empty());
        assert!(submitter.address().await.is_err());
    }

    #[tokio::test]
    async fn test_balance_and_bad_recipient() {
        let ledger = ScriptedLedger::with(vec![]);
        let submitter = submitter(ledger.clone());

        assert_eq!(submitter.balance().await.unwrap(), 12_345);
        let result = submitter.transfer("not-an-address", 1).await;
        assert!(!result.success);
        assert!(ledger.sequence_fetches.lock().unwrap().is_empty());
    }
}
