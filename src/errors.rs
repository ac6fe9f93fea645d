//! Error types for the x402-gate library.
//!
//! [`X402Error`] covers configuration, transport and ledger failures. The payment
//! protocol itself has two narrower taxonomies, [`NonceError`] and [`VerifyError`],
//! whose variants map to stable machine-readable codes that clients branch on.

use thiserror::Error;

/// Main error type for x402-gate operations.
#[derive(Error, Debug)]
pub enum X402Error {
    /// Error during HTTP request/response handling
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Error during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Error during Base64 encoding/decoding
    #[error("Base64 error: {0}")]
    Base64Error(#[from] base64::DecodeError),

    /// The ledger node answered with an API error
    #[error("Ledger API error ({status}): {message}")]
    LedgerApi {
        /// HTTP status returned by the node
        status: u16,
        /// Node error code (e.g. `transaction_not_found`), if present
        error_code: Option<String>,
        /// VM status string for rejected transactions, if present
        vm_error: Option<String>,
        /// Human-readable message
        message: String,
    },

    /// Malformed or unexpected ledger data
    #[error("Ledger error: {0}")]
    LedgerError(String),

    /// Invalid signing key or signing failure
    #[error("Signature error: {0}")]
    SignatureError(String),

    /// Invalid address format
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Invalid amount
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Timeout exceeded
    #[error("Timeout exceeded")]
    TimeoutExceeded,

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The response was not a 402 Payment Required
    #[error("Expected 402 Payment Required, got status: {0}")]
    Not402Response(u16),

    /// A payment was attempted and did not settle
    #[error("Payment failed: {0}")]
    PaymentFailed(String),

    /// Error parsing URL
    #[error("URL parse error: {0}")]
    UrlParseError(#[from] url::ParseError),
}

/// Result type alias for x402-gate operations.
pub type Result<T> = std::result::Result<T, X402Error>;

/// Failures reported by the nonce ledger.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NonceError {
    /// The token was never issued, or has already been garbage collected
    #[error("payment nonce not found")]
    NotFound,

    /// The token was already redeemed by an earlier payment
    #[error("payment nonce already consumed")]
    AlreadyConsumed,

    /// The token's time-to-live has passed
    #[error("payment nonce expired")]
    Expired,
}

impl NonceError {
    /// Stable error code sent to clients.
    pub fn code(&self) -> &'static str {
        match self {
            NonceError::NotFound => "NotFound",
            NonceError::AlreadyConsumed => "AlreadyConsumed",
            NonceError::Expired => "Expired",
        }
    }
}

/// Reasons a claimed payment does not satisfy its challenge.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    /// Nonce lookup failed; passed through unchanged
    #[error(transparent)]
    Nonce(#[from] NonceError),

    /// The ledger has no transaction with the presented hash
    #[error("transaction {0} not found on ledger")]
    TransactionNotFound(String),

    /// The transaction exists but has not been committed yet
    #[error("transaction {0} is still pending")]
    TransactionPending(String),

    /// The transaction was committed with a failing VM status
    #[error("transaction failed on ledger: {0}")]
    TransactionFailed(String),

    /// The transfer went to a different account than the challenge named
    #[error("payment recipient {actual} does not match expected {expected}")]
    RecipientMismatch {
        /// Recipient recorded with the nonce
        expected: String,
        /// Recipient found in the transaction
        actual: String,
    },

    /// The transfer was smaller than the price
    #[error("payment of {actual} octas is below the required {required} octas")]
    AmountTooLow {
        /// Required amount in octas
        required: u128,
        /// Transferred amount in octas
        actual: u128,
    },

    /// The evidence is not a plausible transaction hash or carries no transfer
    #[error("malformed payment evidence: {0}")]
    MalformedEvidence(String),

    /// The transaction already paid for another challenge
    #[error("transaction {0} was already used for a previous payment")]
    TransactionReused(String),

    /// The ledger could not be queried
    #[error("ledger unavailable: {0}")]
    LedgerUnavailable(String),
}

impl VerifyError {
    /// Stable error code sent to clients.
    ///
    /// Clients may retry the same nonce on `TransactionPending`,
    /// `AmountTooLow` (after topping up) and `LedgerUnavailable`.
    pub fn code(&self) -> &'static str {
        match self {
            VerifyError::Nonce(e) => e.code(),
            VerifyError::TransactionNotFound(_) => "TransactionNotFound",
            VerifyError::TransactionPending(_) => "TransactionPending",
            VerifyError::TransactionFailed(_) => "TransactionFailed",
            VerifyError::RecipientMismatch { .. } => "RecipientMismatch",
            VerifyError::AmountTooLow { .. } => "AmountTooLow",
            VerifyError::MalformedEvidence(_) => "MalformedEvidence",
            VerifyError::TransactionReused(_) => "TransactionReused",
            VerifyError::LedgerUnavailable(_) => "LedgerUnavailable",
        }
    }
}
