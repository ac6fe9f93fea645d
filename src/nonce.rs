//! Issuing and redeeming single-use payment nonces.
//!
//! The [`NonceLedger`] is the single owner of outstanding challenges. A nonce
//! moves from unconsumed to consumed exactly once, under the map's write lock,
//! so two requests racing on the same token cannot both redeem it. Expiry is
//! checked before anything else: a nonce past `expires_at` reports `Expired`
//! whether or not it was consumed. Consumed records linger for a short grace
//! window so a retried verification gets `AlreadyConsumed` rather than
//! `NotFound`.

use crate::errors::NonceError;
use crate::types::PaymentNonce;
use crate::utils::{current_timestamp_ms, generate_nonce_token, octas_to_apt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// How long a consumed nonce is kept before garbage collection.
pub const CONSUMED_GRACE: Duration = Duration::from_secs(60);

/// Amount and recipient a nonce was issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceTerms {
    /// Required amount in octas
    pub amount: u128,

    /// Expected recipient address
    pub recipient: String,

    /// When the challenge was issued, epoch milliseconds
    pub issued_at: i64,
}

#[derive(Debug, Clone)]
struct NonceRecord {
    nonce: PaymentNonce,
    issued_at: i64,
    consumed_at: Option<i64>,
}

impl NonceRecord {
    fn is_expired(&self, now: i64) -> bool {
        now > self.nonce.expires_at
    }

    fn is_collectable(&self, now: i64) -> bool {
        match self.consumed_at {
            Some(at) => now - at > CONSUMED_GRACE.as_millis() as i64,
            None => self.is_expired(now),
        }
    }
}

/// Shared store of outstanding payment challenges.
///
/// Cloning is cheap and every clone refers to the same store.
#[derive(Clone, Debug, Default)]
pub struct NonceLedger {
    records: Arc<RwLock<HashMap<String, NonceRecord>>>,
}

impl NonceLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a fresh nonce for `amount` octas payable to `recipient`.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use x402_gate::nonce::NonceLedger;
    ///
    /// # async fn example() {
    /// let ledger = NonceLedger::new();
    /// let nonce = ledger.issue(100_000, "0x1", Duration::from_secs(900)).await;
    /// assert!(!nonce.consumed);
    /// assert_eq!(nonce.required_amount_display, "0.001");
    /// # }
    /// ```
    pub async fn issue(&self, amount: u128, recipient: &str, ttl: Duration) -> PaymentNonce {
        let now = current_timestamp_ms();
        let nonce = PaymentNonce {
            token: generate_nonce_token(),
            required_amount: amount,
            required_amount_display: octas_to_apt(amount),
            recipient: recipient.to_string(),
            expires_at: now.saturating_add(ttl.as_millis() as i64),
            consumed: false,
        };

        let mut records = self.records.write().await;
        records.retain(|_, record| !record.is_collectable(now));
        records.insert(
            nonce.token.clone(),
            NonceRecord {
                nonce: nonce.clone(),
                issued_at: now,
                consumed_at: None,
            },
        );
        tracing::debug!(outstanding = records.len(), expires_at = nonce.expires_at, "issued payment nonce");

        nonce
    }

    /// Checks that `token` can still be redeemed, without changing it.
    ///
    /// An expired record is pruned as a side effect unless it is consumed and
    /// still inside its grace window.
    pub async fn validate(&self, token: &str) -> Result<NonceTerms, NonceError> {
        let now = current_timestamp_ms();
        {
            let records = self.records.read().await;
            match records.get(token) {
                None => return Err(NonceError::NotFound),
                Some(record) if record.is_expired(now) => {}
                Some(record) if record.nonce.consumed => return Err(NonceError::AlreadyConsumed),
                Some(record) => {
                    return Ok(NonceTerms {
                        amount: record.nonce.required_amount,
                        recipient: record.nonce.recipient.clone(),
                        issued_at: record.issued_at,
                    })
                }
            }
        }

        let mut records = self.records.write().await;
        if records.get(token).is_some_and(|r| r.is_expired(now) && r.is_collectable(now)) {
            records.remove(token);
            tracing::debug!("pruned expired payment nonce");
        }
        Err(NonceError::Expired)
    }

    /// Marks `token` consumed.
    ///
    /// Succeeds for exactly one caller; every later call reports
    /// `AlreadyConsumed` and leaves the record consumed. A nonce that expired
    /// before this call is never consumed and reports `Expired`.
    pub async fn consume(&self, token: &str) -> Result<(), NonceError> {
        let now = current_timestamp_ms();
        let mut records = self.records.write().await;
        let record = records.get_mut(token).ok_or(NonceError::NotFound)?;

        if record.is_expired(now) {
            if record.is_collectable(now) {
                records.remove(token);
            }
            return Err(NonceError::Expired);
        }
        if record.nonce.consumed {
            return Err(NonceError::AlreadyConsumed);
        }

        record.nonce.consumed = true;
        record.consumed_at = Some(now);
        tracing::debug!("consumed payment nonce");
        Ok(())
    }

    /// Returns a snapshot of the nonce, if still tracked.
    pub async fn get(&self, token: &str) -> Option<PaymentNonce> {
        self.records.read().await.get(token).map(|r| r.nonce.clone())
    }

    /// Removes expired nonces and consumed nonces past their grace window.
    ///
    /// Returns the number of records removed.
    pub async fn sweep(&self) -> usize {
        let now = current_timestamp_ms();
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| !record.is_collectable(now));
        before - records.len()
    }

    /// Runs [`sweep`](Self::sweep) every `interval` on a background task.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let ledger = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = ledger.sweep().await;
                if removed > 0 {
                    tracing::debug!(removed, "swept payment nonces");
                }
            }
        })
    }

    /// Number of tracked nonces, including consumed ones in their grace window.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Whether no nonces are tracked.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    #[cfg(test)]
    async fn backdate(&self, token: &str, expires_at: i64, consumed_at: Option<i64>) {
        if let Some(record) = self.records.write().await.get_mut(token) {
            record.nonce.expires_at = expires_at;
            if consumed_at.is_some() {
                record.nonce.consumed = true;
                record.consumed_at = consumed_at;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(900);

    #[tokio::test]
    async fn test_issue_and_validate() {
        let ledger = NonceLedger::new();
        let nonce = ledger.issue(100_000, "0xabc", TTL).await;

        assert_eq!(nonce.token.len(), 64);
        let terms = ledger.validate(&nonce.token).await.unwrap();
        assert_eq!(terms.amount, 100_000);
        assert_eq!(terms.recipient, "0xabc");

        // validation does not consume
        assert!(ledger.validate(&nonce.token).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_token() {
        let ledger = NonceLedger::new();
        assert_eq!(ledger.validate("nope").await, Err(NonceError::NotFound));
        assert_eq!(ledger.consume("nope").await, Err(NonceError::NotFound));
    }

    #[tokio::test]
    async fn test_consume_once() {
        let ledger = NonceLedger::new();
        let nonce = ledger.issue(1, "0x1", TTL).await;

        assert!(ledger.consume(&nonce.token).await.is_ok());
        assert_eq!(ledger.consume(&nonce.token).await, Err(NonceError::AlreadyConsumed));
        assert_eq!(ledger.validate(&nonce.token).await, Err(NonceError::AlreadyConsumed));
        assert!(ledger.get(&nonce.token).await.unwrap().consumed);
    }

    #[tokio::test]
    async fn test_expired_on_first_validation() {
        let ledger = NonceLedger::new();
        let nonce = ledger.issue(1, "0x1", TTL).await;
        ledger.backdate(&nonce.token, current_timestamp_ms() - 1_000, None).await;

        assert_eq!(ledger.validate(&nonce.token).await, Err(NonceError::Expired));
        // pruned by the failed validation
        assert_eq!(ledger.validate(&nonce.token).await, Err(NonceError::NotFound));
    }

    #[tokio::test]
    async fn test_expired_nonce_cannot_be_consumed() {
        let ledger = NonceLedger::new();
        let nonce = ledger.issue(1, "0x1", TTL).await;
        ledger.backdate(&nonce.token, current_timestamp_ms() - 1, None).await;

        assert_eq!(ledger.consume(&nonce.token).await, Err(NonceError::Expired));
    }

    #[tokio::test]
    async fn test_expiry_wins_over_consumed() {
        let ledger = NonceLedger::new();
        let nonce = ledger.issue(1, "0x1", TTL).await;
        ledger.consume(&nonce.token).await.unwrap();
        ledger.backdate(&nonce.token, current_timestamp_ms() - 1_000, None).await;

        assert_eq!(ledger.validate(&nonce.token).await, Err(NonceError::Expired));
        assert_eq!(ledger.consume(&nonce.token).await, Err(NonceError::Expired));
        // kept for its grace window, still consumed
        assert!(ledger.get(&nonce.token).await.unwrap().consumed);

        let long_ago = current_timestamp_ms() - CONSUMED_GRACE.as_millis() as i64 - 1_000;
        ledger.backdate(&nonce.token, long_ago, Some(long_ago)).await;
        assert_eq!(ledger.validate(&nonce.token).await, Err(NonceError::Expired));
        assert_eq!(ledger.validate(&nonce.token).await, Err(NonceError::NotFound));
    }

    #[tokio::test]
    async fn test_concurrent_redemption_has_one_winner() {
        let ledger = NonceLedger::new();
        let nonce = ledger.issue(1, "0x1", TTL).await;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let ledger = ledger.clone();
            let token = nonce.token.clone();
            handles.push(tokio::spawn(async move {
                ledger.validate(&token).await?;
                tokio::task::yield_now().await;
                ledger.consume(&token).await
            }));
        }

        let mut wins = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => wins += 1,
                Err(e) => assert_eq!(e, NonceError::AlreadyConsumed),
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_distinct_nonces_are_independent() {
        let ledger = NonceLedger::new();
        let mut tokens = Vec::new();
        for _ in 0..10 {
            tokens.push(ledger.issue(100_000, "0x1", TTL).await.token);
        }

        let mut unique = tokens.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 10);

        ledger.consume(&tokens[0]).await.unwrap();
        for token in &tokens[1..] {
            assert!(ledger.validate(token).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_sweep_respects_grace_window() {
        let ledger = NonceLedger::new();
        let now = current_timestamp_ms();

        let fresh = ledger.issue(1, "0x1", TTL).await;
        let recent = ledger.issue(1, "0x1", TTL).await;
        ledger.consume(&recent.token).await.unwrap();
        let stale = ledger.issue(1, "0x1", TTL).await;
        ledger
            .backdate(&stale.token, now + 1_000_000, Some(now - 2 * CONSUMED_GRACE.as_millis() as i64))
            .await;
        let expired = ledger.issue(1, "0x1", TTL).await;
        ledger.backdate(&expired.token, now - 10, None).await;

        assert_eq!(ledger.sweep().await, 2);
        assert_eq!(ledger.len().await, 2);
        assert!(ledger.get(&fresh.token).await.is_some());
        assert!(ledger.get(&recent.token).await.is_some());
    }

    #[tokio::test]
    async fn test_issue_sweeps_opportunistically() {
        let ledger = NonceLedger::new();
        let old = ledger.issue(1, "0x1", TTL).await;
        ledger.backdate(&old.token, current_timestamp_ms() - 10, None).await;

        ledger.issue(1, "0x1", TTL).await;
        assert_eq!(ledger.len().await, 1);
        assert!(!ledger.is_empty().await);
    }
}
