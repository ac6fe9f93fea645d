//! Core type definitions for the x402 gate.
//!
//! This module contains the wire-level structures exchanged with clients
//! (challenge bodies, error bodies, receipts) and the values passed between
//! the nonce ledger, verifier, gate and transaction submitter.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Version of the x402 protocol spoken by the gate.
pub const X402_VERSION: u32 = 2;

/// The only supported payment scheme: pay at least the quoted amount.
pub const SCHEME_EXACT: &str = "exact";

/// Display symbol of the settlement token.
pub const TOKEN_SYMBOL: &str = "APT";

/// Decimal places between APT and its smallest unit.
pub const TOKEN_DECIMALS: u8 = 8;

/// Octas in one APT.
pub const OCTAS_PER_APT: u128 = 100_000_000;

/// HTTP header names used by the protocol.
pub mod headers {
    /// Transaction hash presented as proof of payment
    pub const X_PAYMENT: &str = "x-payment";
    /// Nonce token from the challenge being answered
    pub const X_PAYMENT_NONCE: &str = "x-payment-nonce";
    /// Always `true` on a challenge
    pub const X_PAYMENT_REQUIRED: &str = "x-payment-required";
    /// Protocol version
    pub const X_PAYMENT_VERSION: &str = "x-payment-version";
    /// Scheme identifier
    pub const X_PAYMENT_SCHEME: &str = "x-payment-scheme";
    /// Network identifier
    pub const X_PAYMENT_NETWORK: &str = "x-payment-network";
    /// Chain id
    pub const X_PAYMENT_CHAIN_ID: &str = "x-payment-chainid";
    /// Token symbol
    pub const X_PAYMENT_TOKEN: &str = "x-payment-token";
    /// Token decimals
    pub const X_PAYMENT_DECIMALS: &str = "x-payment-decimals";
    /// Amount in display units on a challenge, octas on an admission
    pub const X_PAYMENT_AMOUNT: &str = "x-payment-amount";
    /// Amount in octas
    pub const X_PAYMENT_AMOUNT_OCTAS: &str = "x-payment-amountoctas";
    /// Nonce expiry, epoch milliseconds
    pub const X_PAYMENT_NONCE_EXPIRY: &str = "x-payment-nonceexpiry";
    /// Recipient address
    pub const X_PAYMENT_RECIPIENT: &str = "x-payment-recipient";
    /// Human-readable description
    pub const X_PAYMENT_DESCRIPTION: &str = "x-payment-description";
    /// Set on admitted requests
    pub const X_PAYMENT_VERIFIED: &str = "x-payment-verified";
    /// Transaction hash of the admitted payment
    pub const X_PAYMENT_TX_HASH: &str = "x-payment-txhash";
    /// Base64 JSON receipt of the admitted payment
    pub const X_PAYMENT_RESPONSE: &str = "x-payment-response";
}

/// A single-use payment challenge as held by the nonce ledger.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PaymentNonce {
    /// Opaque random token (hex, 256 bits)
    pub token: String,

    /// Required amount in octas; authoritative for comparisons
    pub required_amount: u128,

    /// Required amount in APT, for display only
    pub required_amount_display: String,

    /// Address expected to receive the payment
    pub recipient: String,

    /// Absolute expiry, epoch milliseconds
    pub expires_at: i64,

    /// Set once, when a matching payment is accepted
    pub consumed: bool,
}

/// Machine-readable payment requirements for one issued challenge.
///
/// Every field is emitted both in the 402 JSON body and in a mirrored
/// `X-Payment-*` response header.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    /// Protocol version
    #[serde(rename = "x402Version")]
    pub x402_version: u32,

    /// Payment scheme, always `"exact"`
    pub scheme: String,

    /// Network identifier (e.g. `aptos-testnet`)
    pub network: String,

    /// Ledger chain id
    pub chain_id: u8,

    /// Token symbol
    pub token: String,

    /// Token decimals
    pub token_decimals: u8,

    /// Required amount in APT (decimal string)
    pub amount_required: String,

    /// Required amount in octas (integer string)
    pub amount_required_octas: String,

    /// Recipient address
    pub resource: String,

    /// Nonce token to echo back in `X-Payment-Nonce`
    pub payment_nonce: String,

    /// Nonce expiry, epoch milliseconds
    pub nonce_expiry: i64,

    /// What the payment is for
    pub description: String,

    /// Explorer link for the recipient account
    pub explorer_url: String,
}

/// Body of a 402 challenge response.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PaymentRequiredResponse {
    /// Always `"Payment Required"`
    pub error: String,

    /// Instructions for the client
    pub message: String,

    /// The requirements, flattened into the top-level object
    #[serde(flatten)]
    pub requirements: PaymentRequirements,
}

/// Body of a 402 rejection: a verification failure with no fresh challenge.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PaymentErrorResponse {
    /// Stable error code (e.g. `AmountTooLow`)
    pub error: String,

    /// Diagnostic message
    pub details: String,
}

/// Proof that a request was paid for.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VerifiedPayment {
    /// Sender of the payment; unknown in fallback mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,

    /// Octas transferred; unknown in fallback mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<u128>,

    /// Transaction hash presented by the client
    pub tx_ref: String,

    /// Whether this was admitted without contacting the ledger
    pub fallback: bool,
}

/// Outcome of one logical transaction submission, retries included.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionResult {
    /// Transaction hash; empty when nothing was broadcast
    pub hash: String,

    /// Whether the transaction committed successfully
    pub success: bool,

    /// Gas units consumed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_used: Option<u64>,

    /// VM status reported by the ledger
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_status: Option<String>,

    /// Error summary for failed submissions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TransactionResult {
    /// A submission that never produced a settled transaction.
    pub fn failed(hash: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            success: false,
            gas_used: None,
            vm_status: None,
            error: Some(error.into()),
        }
    }
}

/// Entry function payload in the ledger's JSON encoding.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EntryFunctionPayload {
    /// Always `entry_function_payload`
    #[serde(rename = "type")]
    pub payload_type: String,

    /// Fully qualified function, e.g. `0x1::aptos_account::transfer`
    pub function: String,

    /// Generic type arguments
    pub type_arguments: Vec<String>,

    /// Function arguments, JSON-encoded as the node expects
    pub arguments: Vec<Value>,
}

impl EntryFunctionPayload {
    /// Creates a payload calling `function` with the given arguments.
    pub fn new(function: impl Into<String>, type_arguments: Vec<String>, arguments: Vec<Value>) -> Self {
        Self {
            payload_type: "entry_function_payload".to_string(),
            function: function.into(),
            type_arguments,
            arguments,
        }
    }

    /// Native APT transfer of `amount` octas to `recipient`.
    pub fn apt_transfer(recipient: &str, amount: u128) -> Self {
        Self::new(
            "0x1::aptos_account::transfer",
            vec![],
            vec![Value::String(recipient.to_string()), Value::String(amount.to_string())],
        )
    }
}

/// Receipt returned in the `X-Payment-Response` header after admission.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PaymentResponse {
    /// Transaction hash of the payment
    #[serde(rename = "txHash")]
    pub tx_hash: String,

    /// Time of verification (RFC 3339)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settled_at: Option<String>,

    /// Additional metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_requirements() -> PaymentRequirements {
        PaymentRequirements {
            x402_version: X402_VERSION,
            scheme: SCHEME_EXACT.to_string(),
            network: "aptos-testnet".to_string(),
            chain_id: 2,
            token: TOKEN_SYMBOL.to_string(),
            token_decimals: TOKEN_DECIMALS,
            amount_required: "0.001".to_string(),
            amount_required_octas: "100000".to_string(),
            resource: "0xabc".to_string(),
            payment_nonce: "ff".repeat(32),
            nonce_expiry: 1_700_000_000_000,
            description: "AI threat scan".to_string(),
            explorer_url: "https://explorer.aptoslabs.com/account/0xabc?network=testnet".to_string(),
        }
    }

    #[test]
    fn test_challenge_body_field_names() {
        let body = PaymentRequiredResponse {
            error: "Payment Required".to_string(),
            message: "pay".to_string(),
            requirements: sample_requirements(),
        };

        let json = serde_json::to_value(&body).unwrap();
        for field in [
            "error",
            "message",
            "x402Version",
            "scheme",
            "network",
            "chainId",
            "token",
            "tokenDecimals",
            "amountRequired",
            "amountRequiredOctas",
            "resource",
            "paymentNonce",
            "nonceExpiry",
            "description",
            "explorerUrl",
        ] {
            assert!(json.get(field).is_some(), "missing {field}");
        }
        assert_eq!(json["x402Version"], 2);
        assert_eq!(json["amountRequiredOctas"], "100000");
    }

    #[test]
    fn test_challenge_body_parses_back() {
        let body = PaymentRequiredResponse {
            error: "Payment Required".to_string(),
            message: "pay".to_string(),
            requirements: sample_requirements(),
        };

        let json = serde_json::to_string(&body).unwrap();
        let parsed: PaymentRequiredResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.requirements, sample_requirements());
    }

    #[test]
    fn test_apt_transfer_payload() {
        let payload = EntryFunctionPayload::apt_transfer("0x1234", 100_000);
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["type"], "entry_function_payload");
        assert_eq!(json["function"], "0x1::aptos_account::transfer");
        assert_eq!(json["arguments"][1], "100000");
    }

    #[test]
    fn test_failed_transaction_result() {
        let result = TransactionResult::failed("", "insufficient balance");
        assert!(!result.success);
        assert!(result.hash.is_empty());

        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("gasUsed").is_none());
        assert_eq!(json["error"], "insufficient balance");
    }
}
