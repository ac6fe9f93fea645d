//! Aptos fullnode REST client.
//!
//! Implements [`Ledger`] over the node's `/v1` JSON API. Signing messages are
//! obtained from `/transactions/encode_submission`, so the client never has
//! to BCS-encode transactions itself.

use crate::errors::{Result, X402Error};
use crate::ledger::{Ledger, LedgerTransaction, SignedTransaction, UnsignedTransaction};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use url::Url;

/// Per-request HTTP timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Error body returned by the node.
#[derive(Deserialize, Debug)]
struct NodeError {
    message: String,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    vm_error_code: Option<u64>,
}

#[derive(Deserialize, Debug)]
struct AccountData {
    sequence_number: String,
}

#[derive(Deserialize, Debug)]
struct PendingTransaction {
    hash: String,
}

/// [`Ledger`] backed by an Aptos fullnode.
#[derive(Clone, Debug)]
pub struct AptosClient {
    base_url: Url,
    http: Client,
}

impl AptosClient {
    /// Creates a client for the node at `node_url` (e.g. `https://fullnode.testnet.aptoslabs.com/v1`).
    ///
    /// # Examples
    ///
    /// ```
    /// use x402_gate::ledger::aptos::AptosClient;
    ///
    /// let client = AptosClient::new("https://fullnode.testnet.aptoslabs.com/v1").unwrap();
    /// assert!(client.base_url().as_str().ends_with("/v1/"));
    /// ```
    pub fn new(node_url: &str) -> Result<Self> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Self::with_client(node_url, http)
    }

    /// Creates a client using a caller-provided HTTP client.
    pub fn with_client(node_url: &str, http: Client) -> Result<Self> {
        let mut base = node_url.trim_end_matches('/').to_string();
        base.push('/');
        Ok(Self {
            base_url: Url::parse(&base)?,
            http,
        })
    }

    /// The node's base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    /// Turns a non-success response into [`X402Error::LedgerApi`].
    async fn api_error(response: Response) -> X402Error {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<NodeError>(&body) {
            Ok(err) => X402Error::LedgerApi {
                status,
                error_code: err.error_code,
                vm_error: err.vm_error_code.map(|c| c.to_string()),
                message: err.message,
            },
            Err(_) => X402Error::LedgerApi {
                status,
                error_code: None,
                vm_error: None,
                message: if body.is_empty() { "empty response".to_string() } else { body },
            },
        }
    }
}

#[async_trait]
impl Ledger for AptosClient {
    async fn sequence_number(&self, address: &str) -> Result<u64> {
        let url = self.endpoint(&format!("accounts/{}", address))?;
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let account: AccountData = response.json().await?;
        account
            .sequence_number
            .parse()
            .map_err(|e| X402Error::LedgerError(format!("bad sequence number '{}': {}", account.sequence_number, e)))
    }

    async fn account_resource(&self, address: &str, resource_type: &str) -> Result<Option<Value>> {
        let url = self.endpoint(&format!("accounts/{}/resource/{}", address, resource_type))?;
        let response = self.http.get(url).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(response.json().await?)),
            _ => Err(Self::api_error(response).await),
        }
    }

    async fn encode_submission(&self, transaction: &UnsignedTransaction) -> Result<Vec<u8>> {
        let url = self.endpoint("transactions/encode_submission")?;
        let response = self.http.post(url).json(transaction).send().await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let encoded: String = response.json().await?;
        hex::decode(encoded.trim_start_matches("0x"))
            .map_err(|e| X402Error::LedgerError(format!("bad signing message: {}", e)))
    }

    async fn submit_transaction(&self, transaction: &SignedTransaction) -> Result<String> {
        let url = self.endpoint("transactions")?;
        let response = self.http.post(url).json(transaction).send().await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let pending: PendingTransaction = response.json().await?;
        Ok(pending.hash)
    }

    async fn transaction_by_hash(&self, hash: &str) -> Result<Option<LedgerTransaction>> {
        let url = self.endpoint(&format!("transactions/by_hash/{}", hash))?;
        let response = self.http.get(url).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(response.json().await?)),
            _ => Err(Self::api_error(response).await),
        }
    }
}
