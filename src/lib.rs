//! # x402-gate
//!
//! An HTTP 402 "Payment Required" gate for APT micropayments on Aptos.
//!
//! The gate sits in front of priced API routes. A request without payment gets
//! a 402 carrying a single-use nonce and the exact amount to pay; the client
//! pays on-chain and retries with the transaction hash and the nonce; the gate
//! checks the transaction on the ledger and admits the request. On the paying
//! side, a single server identity submits transactions one at a time so its
//! sequence number never races.
//!
//! ## Features
//!
//! - **Payment gate**: axum middleware issuing 402 challenges, with whole-route
//!   and per-action pricing
//! - **Nonce ledger**: single-use, time-bound challenges with atomic redemption
//! - **Verification**: on-chain checks of recipient, amount and status, plus
//!   transaction-hash replay protection
//! - **Transaction submission**: serialized, retrying submitter for a single
//!   Ed25519 signing identity
//! - **Agent client**: pays 402 challenges automatically
//!
//! ## Quick Start
//!
//! ### Server Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use axum::{middleware, routing::post, Router};
//! use x402_gate::{payment_gate, GateConfig, PaymentGate};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = GateConfig::new("0x1f7c6a0e5c3b0b9d5f7e3a2c1d4b6e8f0a1c3e5d7f9b2d4f6a8c0e2b4d6f8a0c")?;
//! let gate = Arc::new(PaymentGate::from_config(config)?);
//!
//! let app = Router::new()
//!     .route("/api/scan", post(|| async { "scan result" }))
//!     .layer(middleware::from_fn_with_state(gate, payment_gate));
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Client Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use x402_gate::client::X402Client;
//! use x402_gate::config::SubmitterConfig;
//! use x402_gate::ledger::aptos::AptosClient;
//! use x402_gate::TransactionSubmitter;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ledger = Arc::new(AptosClient::new("https://fullnode.testnet.aptoslabs.com/v1")?);
//! let submitter = TransactionSubmitter::new(ledger, Some("0xYOUR_PRIVATE_KEY".into()), SubmitterConfig::default());
//! let client = X402Client::new(Arc::new(submitter));
//!
//! let response = client.post("http://localhost:3000/api/scan", serde_json::json!({})).await?;
//! println!("Response: {}", response.text().await?);
//! # Ok(())
//! # }
//! ```
//!
//! ## Protocol Overview
//!
//! 1. **Client requests a priced route**: plain HTTP request
//! 2. **Gate responds with 402**: requirements in the JSON body and mirrored
//!    into `X-Payment-*` headers, including a fresh `paymentNonce`
//! 3. **Client pays**: transfers `amountRequiredOctas` to `resource` on-chain
//! 4. **Client retries**: `X-Payment: <tx hash>` and `X-Payment-Nonce: <nonce>`
//! 5. **Gate verifies**: nonce unexpired and unused, transaction committed,
//!    recipient and amount match; the nonce is consumed
//! 6. **Gate admits**: the action runs and the response carries
//!    `X-Payment-Verified: true` and a base64 `X-Payment-Response` receipt
//!
//! Verification failures are answered with 402 and `{error, details}`, where
//! `error` is a stable code such as `AmountTooLow` or `AlreadyConsumed`.
//!
//! ## Fallback Mode
//!
//! With no recipient configured (or `X402_FALLBACK_MODE=true`) the gate admits
//! any well-formed transaction hash without contacting the ledger. This is a
//! deliberate weakening for environments without ledger access and is logged
//! at `warn` on every admission.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod client;
pub mod config;
pub mod errors;
pub mod gate;
pub mod ledger;
pub mod nonce;
pub mod pricing;
pub mod signer;
pub mod submitter;
pub mod types;
pub mod utils;
pub mod verifier;

// Re-export commonly used items
pub use config::{GateConfig, SubmitterConfig};
pub use errors::{NonceError, Result, VerifyError, X402Error};
pub use gate::{payment_gate, PaymentGate};
pub use nonce::NonceLedger;
pub use pricing::{PriceEntry, PricingPolicy};
pub use submitter::TransactionSubmitter;
pub use types::{PaymentRequirements, TransactionResult, VerifiedPayment, X402_VERSION};
pub use verifier::PaymentVerifier;
