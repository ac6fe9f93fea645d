//! Ledger access.
//!
//! The gate needs only a handful of ledger operations: read an account's
//! sequence number or a resource, turn an unsigned transaction into the bytes
//! to sign, broadcast a signed transaction, and look a transaction up by hash.
//! They are expressed by the [`Ledger`] trait so the verifier and submitter
//! can run against the Aptos REST API ([`aptos::AptosClient`]) or a stand-in.

pub mod aptos;

use crate::errors::Result;
use crate::types::EntryFunctionPayload;
use crate::utils::addresses_match;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Entry functions that move APT from the sender to the first argument.
const TRANSFER_FUNCTIONS: &[&str] = &[
    "0x1::aptos_account::transfer",
    "0x1::aptos_account::transfer_coins",
    "0x1::coin::transfer",
];

const APT_COIN_TYPE: &str = "0x1::aptos_coin::AptosCoin";

/// Operations the gate needs from a ledger network.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Current on-chain sequence number of `address`.
    async fn sequence_number(&self, address: &str) -> Result<u64>;

    /// Reads a resource stored under `address`, `None` if absent.
    async fn account_resource(&self, address: &str, resource_type: &str) -> Result<Option<Value>>;

    /// Produces the signing message for an unsigned transaction.
    async fn encode_submission(&self, transaction: &UnsignedTransaction) -> Result<Vec<u8>>;

    /// Broadcasts a signed transaction and returns its hash.
    async fn submit_transaction(&self, transaction: &SignedTransaction) -> Result<String>;

    /// Looks up a pending or committed transaction, `None` if unknown.
    async fn transaction_by_hash(&self, hash: &str) -> Result<Option<LedgerTransaction>>;
}

/// A transaction ready to be signed, in the node's JSON encoding.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UnsignedTransaction {
    /// Sender address
    pub sender: String,

    /// Sender's sequence number for this transaction
    pub sequence_number: String,

    /// Gas limit
    pub max_gas_amount: String,

    /// Gas price in octas
    pub gas_unit_price: String,

    /// Expiration, Unix seconds
    pub expiration_timestamp_secs: String,

    /// Entry function to execute
    pub payload: EntryFunctionPayload,
}

/// Signature attached to a submitted transaction.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TransactionSignature {
    /// Always `ed25519_signature`
    #[serde(rename = "type")]
    pub signature_type: String,

    /// Signer public key, `0x` hex
    pub public_key: String,

    /// Signature over the signing message, `0x` hex
    pub signature: String,
}

/// A signed transaction as posted to the node.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SignedTransaction {
    /// The transaction body
    #[serde(flatten)]
    pub transaction: UnsignedTransaction,

    /// Authenticator
    pub signature: TransactionSignature,
}

/// Creator of an event handle.
#[derive(Deserialize, Debug, Clone)]
pub struct EventGuid {
    /// Account owning the event handle
    pub account_address: String,
}

/// An event emitted by a committed transaction.
#[derive(Deserialize, Debug, Clone)]
pub struct LedgerEvent {
    /// Handle the event was emitted on (legacy events only)
    #[serde(default)]
    pub guid: Option<EventGuid>,

    /// Move type of the event
    #[serde(rename = "type")]
    pub event_type: String,

    /// Event fields
    #[serde(default)]
    pub data: Value,
}

/// A pending or committed transaction as returned by the node.
#[derive(Deserialize, Debug, Clone)]
pub struct LedgerTransaction {
    /// `pending_transaction`, `user_transaction`, ...
    #[serde(rename = "type")]
    pub transaction_type: String,

    /// Transaction hash
    pub hash: String,

    /// Sender, for user transactions
    #[serde(default)]
    pub sender: Option<String>,

    /// Execution outcome, committed transactions only
    #[serde(default)]
    pub success: Option<bool>,

    /// VM status, committed transactions only
    #[serde(default)]
    pub vm_status: Option<String>,

    /// Gas used, as a decimal string
    #[serde(default)]
    pub gas_used: Option<String>,

    /// Commit time in microseconds, as a decimal string
    #[serde(default)]
    pub timestamp: Option<String>,

    /// Payload as submitted
    #[serde(default)]
    pub payload: Option<Value>,

    /// Emitted events
    #[serde(default)]
    pub events: Vec<LedgerEvent>,
}

/// Recipient and amount of an APT transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    /// Receiving account
    pub recipient: String,

    /// Octas moved
    pub amount: u128,
}

impl LedgerTransaction {
    /// Whether the transaction is still waiting in the mempool.
    pub fn is_pending(&self) -> bool {
        self.transaction_type == "pending_transaction"
    }

    /// Whether it committed with a successful VM status.
    pub fn is_success(&self) -> bool {
        !self.is_pending() && self.success.unwrap_or(false)
    }

    /// Gas used as an integer.
    pub fn gas_used_units(&self) -> Option<u64> {
        self.gas_used.as_deref().and_then(|g| g.parse().ok())
    }

    /// Commit time in epoch milliseconds.
    pub fn timestamp_ms(&self) -> Option<i64> {
        self.timestamp
            .as_deref()
            .and_then(|t| t.parse::<i64>().ok())
            .map(|micros| micros / 1_000)
    }

    /// Extracts the APT transfer this transaction made to `recipient`.
    ///
    /// A payload calling a known transfer function decides on its own: it
    /// either moves APT or it doesn't, and then the events are not consulted.
    /// For other payloads the APT `CoinDeposit` events reaching `recipient`
    /// are summed. When none reach it, the first APT deposit is returned so
    /// the caller can report who was paid instead.
    pub fn transfer_to(&self, recipient: &str) -> Option<Transfer> {
        match self.payload_transfer() {
            PayloadTransfer::Apt(transfer) => Some(transfer),
            PayloadTransfer::NotApt => None,
            PayloadTransfer::Unrecognized => self.transfer_from_events(recipient),
        }
    }

    fn payload_transfer(&self) -> PayloadTransfer {
        let Some(payload) = self.payload.as_ref() else {
            return PayloadTransfer::Unrecognized;
        };
        let function = payload.get("function").and_then(Value::as_str);
        if !function.is_some_and(|f| TRANSFER_FUNCTIONS.contains(&f)) {
            return PayloadTransfer::Unrecognized;
        }

        let coin = payload
            .get("type_arguments")
            .and_then(Value::as_array)
            .and_then(|args| args.first())
            .map(|arg| arg.as_str().unwrap_or_default());
        if coin.is_some_and(|c| c != APT_COIN_TYPE) {
            return PayloadTransfer::NotApt;
        }

        let transfer = payload.get("arguments").and_then(Value::as_array).and_then(|args| {
            Some(Transfer {
                recipient: args.first()?.as_str()?.to_string(),
                amount: json_amount(args.get(1)?)?,
            })
        });
        match transfer {
            Some(transfer) => PayloadTransfer::Apt(transfer),
            None => PayloadTransfer::NotApt,
        }
    }

    fn transfer_from_events(&self, recipient: &str) -> Option<Transfer> {
        let deposits: Vec<Transfer> = self.events.iter().filter_map(apt_deposit).collect();

        let mut paid: Option<u128> = None;
        for deposit in deposits.iter().filter(|d| addresses_match(&d.recipient, recipient)) {
            paid = Some(paid.unwrap_or(0).saturating_add(deposit.amount));
        }
        match paid {
            Some(amount) => Some(Transfer {
                recipient: recipient.to_string(),
                amount,
            }),
            None => deposits.into_iter().next(),
        }
    }
}

enum PayloadTransfer {
    Apt(Transfer),
    NotApt,
    Unrecognized,
}

/// Reads a `CoinDeposit` module event whose coin type is APT.
///
/// Legacy `DepositEvent`s are skipped: they carry no coin type.
fn apt_deposit(event: &LedgerEvent) -> Option<Transfer> {
    if !event.event_type.starts_with("0x1::coin::CoinDeposit") {
        return None;
    }
    if event.data.get("coin_type").and_then(Value::as_str) != Some(APT_COIN_TYPE) {
        return None;
    }
    Some(Transfer {
        recipient: event.data.get("account")?.as_str()?.to_string(),
        amount: json_amount(event.data.get("amount")?)?,
    })
}

/// Reads an amount that the node encodes either as a string or a number.
fn json_amount(value: &Value) -> Option<u128> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64().map(u128::from),
        _ => None,
    }
}
