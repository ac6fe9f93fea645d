//! The paying side of the 402 handshake.
//!
//! [`X402Client`] sends a request, and when the server answers 402 it pays the
//! advertised amount from the server-side signing identity through a
//! [`TransactionSubmitter`], then retries with `X-Payment` and
//! `X-Payment-Nonce`. A payment that does not settle aborts the request: the
//! retry is never sent without a committed transaction behind it.

use crate::errors::{Result, X402Error};
use crate::submitter::TransactionSubmitter;
use crate::types::{headers, PaymentRequiredResponse, PaymentRequirements, SCHEME_EXACT, X402_VERSION};
use crate::utils::decode_payment_response;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, Response, StatusCode};
use serde_json::Value;
use std::sync::Arc;

/// HTTP client that settles 402 challenges automatically.
#[derive(Clone)]
pub struct X402Client {
    http: Client,
    submitter: Arc<TransactionSubmitter>,
    network: Option<String>,
    max_amount: Option<u128>,
}

impl X402Client {
    /// Creates a client that pays through `submitter`.
    pub fn new(submitter: Arc<TransactionSubmitter>) -> Self {
        Self {
            http: Client::new(),
            submitter,
            network: None,
            max_amount: None,
        }
    }

    /// Sets a custom HTTP client.
    pub fn with_client(mut self, client: Client) -> Self {
        self.http = client;
        self
    }

    /// Only pays challenges for this network (e.g. `aptos-testnet`).
    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    /// Refuses to pay more than `octas` for a single request.
    pub fn with_max_amount(mut self, octas: u128) -> Self {
        self.max_amount = Some(octas);
        self
    }

    /// Sends a request, paying for it if the server demands payment.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use std::sync::Arc;
    /// use reqwest::Method;
    /// use serde_json::json;
    /// use x402_gate::client::X402Client;
    /// use x402_gate::config::SubmitterConfig;
    /// use x402_gate::ledger::aptos::AptosClient;
    /// use x402_gate::submitter::TransactionSubmitter;
    ///
    /// # async fn example() -> x402_gate::Result<()> {
    /// let ledger = Arc::new(AptosClient::new("https://fullnode.testnet.aptoslabs.com/v1")?);
    /// let submitter = TransactionSubmitter::new(ledger, Some("0xKEY".into()), SubmitterConfig::default());
    /// let client = X402Client::new(Arc::new(submitter)).with_max_amount(1_000_000);
    ///
    /// let response = client
    ///     .request(Method::POST, "http://localhost:3000/api/scan", Some(json!({"protocol": "0x1"})))
    ///     .await?;
    /// println!("{}", response.text().await?);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn request(&self, method: Method, url: &str, body: Option<Value>) -> Result<Response> {
        let response = self.send(method.clone(), url, body.as_ref(), None).await?;
        if response.status() != StatusCode::PAYMENT_REQUIRED {
            return Ok(response);
        }

        let response_headers = response.headers().clone();
        let text = response.text().await?;
        let requirements = parse_challenge(&response_headers, &text)?;
        let amount = self.check_requirements(&requirements)?;

        tracing::info!(
            url,
            amount_octas = %amount,
            recipient = %requirements.resource,
            "paying for request"
        );
        let payment = self.submitter.transfer(&requirements.resource, amount).await;
        if !payment.success {
            return Err(X402Error::PaymentFailed(
                payment.error.or(payment.vm_status).unwrap_or_else(|| "transaction did not commit".to_string()),
            ));
        }

        let retry = self
            .send(method, url, body.as_ref(), Some((payment.hash.as_str(), requirements.payment_nonce.as_str())))
            .await?;

        if let Some(receipt) = retry
            .headers()
            .get(headers::X_PAYMENT_RESPONSE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| decode_payment_response(v).ok())
        {
            tracing::debug!(tx_hash = %receipt.tx_hash, "payment receipt received");
        }
        Ok(retry)
    }

    /// `GET` with automatic payment.
    pub async fn get(&self, url: &str) -> Result<Response> {
        self.request(Method::GET, url, None).await
    }

    /// `POST` a JSON body with automatic payment.
    pub async fn post(&self, url: &str, body: Value) -> Result<Response> {
        self.request(Method::POST, url, Some(body)).await
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        evidence: Option<(&str, &str)>,
    ) -> Result<Response> {
        let mut request = self.http.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }
        if let Some((tx_hash, nonce)) = evidence {
            request = request
                .header(headers::X_PAYMENT, tx_hash)
                .header(headers::X_PAYMENT_NONCE, nonce);
        }
        Ok(request.send().await?)
    }

    /// Validates a challenge against the client's limits, returning the octas to pay.
    fn check_requirements(&self, requirements: &PaymentRequirements) -> Result<u128> {
        if requirements.scheme != SCHEME_EXACT {
            return Err(X402Error::PaymentFailed(format!("unsupported scheme '{}'", requirements.scheme)));
        }
        if let Some(network) = &self.network {
            if &requirements.network != network {
                return Err(X402Error::PaymentFailed(format!(
                    "challenge is for network '{}', client pays on '{}'",
                    requirements.network, network
                )));
            }
        }

        let amount: u128 = requirements
            .amount_required_octas
            .parse()
            .map_err(|_| X402Error::InvalidAmount(requirements.amount_required_octas.clone()))?;
        if let Some(max) = self.max_amount {
            if amount > max {
                return Err(X402Error::PaymentFailed(format!(
                    "challenge asks {} octas, above the limit of {}",
                    amount, max
                )));
            }
        }
        Ok(amount)
    }
}

/// Reads the requirements of a 402 response, from the body or else the headers.
pub fn parse_challenge(response_headers: &HeaderMap, body: &str) -> Result<PaymentRequirements> {
    match serde_json::from_str::<PaymentRequiredResponse>(body) {
        Ok(parsed) => Ok(parsed.requirements),
        Err(body_err) => requirements_from_headers(response_headers).ok_or(X402Error::JsonError(body_err)),
    }
}

fn requirements_from_headers(map: &HeaderMap) -> Option<PaymentRequirements> {
    let get = |name: &str| map.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);
    if get(headers::X_PAYMENT_REQUIRED).as_deref() != Some("true") {
        return None;
    }

    Some(PaymentRequirements {
        x402_version: get(headers::X_PAYMENT_VERSION)
            .and_then(|v| v.parse().ok())
            .unwrap_or(X402_VERSION),
        scheme: get(headers::X_PAYMENT_SCHEME)?,
        network: get(headers::X_PAYMENT_NETWORK)?,
        chain_id: get(headers::X_PAYMENT_CHAIN_ID)?.parse().ok()?,
        token: get(headers::X_PAYMENT_TOKEN)?,
        token_decimals: get(headers::X_PAYMENT_DECIMALS)?.parse().ok()?,
        amount_required: get(headers::X_PAYMENT_AMOUNT)?,
        amount_required_octas: get(headers::X_PAYMENT_AMOUNT_OCTAS)?,
        resource: get(headers::X_PAYMENT_RECIPIENT)?,
        payment_nonce: get(headers::X_PAYMENT_NONCE)?,
        nonce_expiry: get(headers::X_PAYMENT_NONCE_EXPIRY)?.parse().ok()?,
        description: get(headers::X_PAYMENT_DESCRIPTION).unwrap_or_default(),
        explorer_url: String::new(),
    })
}
