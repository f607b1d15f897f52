// =============================================================================
// SATLINK v1.2 - Payment Channels
// =============================================================================
//
// Two-party micropayment channels: the client locks value into an on-chain
// contract, then pays the server in increments by re-signing an off-chain
// payment transaction with an ever-larger server share. The server keeps
// only the best (highest-value) signature and broadcasts it at close. The
// client keeps a timelocked refund transaction it can broadcast alone once
// the channel expires, so a vanished server can never strand the funds.
//
// Architecture:
// ┌─────────────────────────────────────────────────────────────────────────┐
// │                        PAYMENT CHANNELS                                 │
// ├─────────────────────────────────────────────────────────────────────────┤
// │                                                                         │
// │  ┌──────────┐   contract / refund / payments    ┌──────────┐            │
// │  │  Client  │──────────────────────────────────▶│  Server  │            │
// │  │  State   │◀──────────────────────────────────│  State   │            │
// │  └──────────┘   signatures / acks               └──────────┘            │
// │       │                                              │                  │
// │       ▼                                              ▼                  │
// │  ┌──────────┐    ┌──────────────┐    ┌─────────────────────┐            │
// │  │ Channel  │    │ WalletSource │    │    TxBroadcaster    │            │
// │  │  Store   │    │ (funding +   │    │ (submit, confirm    │            │
// │  │ (sled)   │    │  signing)    │    │  via oneshot)       │            │
// │  └──────────┘    └──────────────┘    └─────────────────────┘            │
// │                                                                         │
// └─────────────────────────────────────────────────────────────────────────┘
//
// Locking model: a state object is a plain owned value with exclusive
// methods (&mut self). The session driving a channel wraps it in a single
// Mutex and never holds the lock across an await: broadcast confirmation
// comes back as a oneshot receiver the caller awaits after releasing state.
//
// =============================================================================

pub mod client;
pub mod messages;
pub mod server;
pub mod store;

pub use client::PaymentChannelClientState;
pub use messages::ChannelMessage;
pub use server::PaymentChannelServerState;
pub use store::{SledChannelStore, StoredChannel};

use std::fmt;

use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::{ChannelError, VerificationError};
use crate::merkle::Hash256;
use crate::script;
use crate::transaction::{OutPoint, Transaction, TxIn, TxOut};
use crate::{DUST_LIMIT, MAX_MONEY};

// =============================================================================
// Constants
// =============================================================================

/// Flat fee carried by every channel transaction (contract, refund,
/// payment), always taken out of the client's side.
pub const CHANNEL_TX_FEE: u64 = 1_000;

/// Smallest channel worth opening: must cover the fee and still leave a
/// spendable output.
pub const MIN_CHANNEL_VALUE: u64 = CHANNEL_TX_FEE + DUST_LIMIT + 1;

/// Default channel lifetime (24 hours).
pub const DEFAULT_EXPIRY_SECS: u64 = 24 * 60 * 60;

/// A server refuses refunds expiring sooner than this far in the future:
/// it needs room to broadcast the best payment before the client can
/// reclaim everything.
pub const SERVER_MIN_EXPIRY_DELTA: u64 = 2 * 60 * 60;

// =============================================================================
// ChannelId
// =============================================================================

/// Channel identifier: the contract transaction's txid.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub [u8; 32]);

impl ChannelId {
    pub fn from_contract(contract: &Transaction) -> Self {
        ChannelId(contract.txid())
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({})", self)
    }
}

// =============================================================================
// ChannelVersion
// =============================================================================

/// Protocol version of a channel. The state machines are identical across
/// versions; only the contract output's locking shape differs, so this is
/// the single switch point for script construction and verification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelVersion {
    /// Raw 2-of-2 multisig contract output.
    V1,
    /// CLTV redeem script (cooperative multisig, or client alone after
    /// expiry) wrapped in P2SH. The refund path lives in the script, so a
    /// v2 client can reclaim funds without a pre-signed refund tx; the
    /// refund transaction is still negotiated for uniform close handling.
    V2,
}

impl ChannelVersion {
    /// The contract output's scriptPubKey for the channel keys.
    pub fn contract_script(&self, client: &PublicKey, server: &PublicKey, expiry: u64) -> Vec<u8> {
        match self {
            ChannelVersion::V1 => script::multisig_2of2(client, server),
            ChannelVersion::V2 => {
                script::p2sh_script(&script::cltv_redeem_script(client, server, expiry))
            }
        }
    }

    /// The script the signature digest commits to: the locking script
    /// itself for v1, the redeem script for v2 (P2SH signs the redeem
    /// script, not the wrapper).
    pub fn script_code(&self, client: &PublicKey, server: &PublicKey, expiry: u64) -> Vec<u8> {
        match self {
            ChannelVersion::V1 => script::multisig_2of2(client, server),
            ChannelVersion::V2 => script::cltv_redeem_script(client, server, expiry),
        }
    }

    /// Completed scriptSig spending the contract output cooperatively.
    pub fn cooperative_script_sig(
        &self,
        sig_client: &[u8],
        sig_server: &[u8],
        client: &PublicKey,
        server: &PublicKey,
        expiry: u64,
    ) -> Vec<u8> {
        match self {
            ChannelVersion::V1 => script::multisig_script_sig(sig_client, sig_server),
            ChannelVersion::V2 => script::cltv_multisig_script_sig(
                sig_client,
                sig_server,
                &script::cltv_redeem_script(client, server, expiry),
            ),
        }
    }
}

// =============================================================================
// Collaborator traits
// =============================================================================

/// Funding and signing capability supplied by the embedding wallet.
pub trait WalletSource {
    /// Selects inputs worth at least `target` satoshis. Returns the inputs
    /// and their combined value (change handling is the caller's job).
    fn fund(&mut self, target: u64) -> Result<(Vec<TxIn>, u64), ChannelError>;

    /// Script to send change (and refunds) to.
    fn change_script(&self) -> Vec<u8>;

    /// Signs a wallet-owned input of `tx` in place.
    fn sign_input(&self, tx: &mut Transaction, input_index: usize) -> Result<(), ChannelError>;
}

/// Transaction submission capability. The returned receiver resolves with
/// the confirmed transaction; if the network silently drops it, the
/// receiver never resolves and the caller must apply its own timeout.
pub trait TxBroadcaster {
    fn broadcast(&self, tx: &Transaction) -> oneshot::Receiver<Transaction>;
}

/// Persistence capability, keyed by channel id. Implementations must
/// serialize concurrent access per id.
pub trait ChannelStore {
    fn put(&self, id: &ChannelId, record: &StoredChannel) -> Result<(), ChannelError>;
    fn get(&self, id: &ChannelId) -> Result<Option<StoredChannel>, ChannelError>;
    fn remove(&self, id: &ChannelId) -> Result<(), ChannelError>;
}

// =============================================================================
// Shared transaction builders
// =============================================================================

/// Deterministic unsigned payment transaction for a given split. Both
/// sides rebuild this byte-for-byte to agree on the digest being signed:
/// output 0 pays the server, output 1 returns the remainder to the
/// client, and the flat fee comes out of the client's side. The server
/// share must already satisfy `check_payment_value` (the state machines
/// enforce it); a client remainder at or below dust is folded into the
/// fee.
pub fn build_payment_tx(
    contract_txid: Hash256,
    channel_value: u64,
    value_to_server: u64,
    server_script: &[u8],
    client_script: &[u8],
) -> Transaction {
    let client_remainder = channel_value
        .saturating_sub(value_to_server)
        .saturating_sub(CHANNEL_TX_FEE);

    let mut tx = Transaction::new();
    tx.inputs.push(TxIn::unsigned(OutPoint::new(contract_txid, 0)));
    tx.outputs.push(TxOut::new(value_to_server, server_script.to_vec()));
    if client_remainder > DUST_LIMIT {
        tx.outputs.push(TxOut::new(client_remainder, client_script.to_vec()));
    }
    tx
}

/// Unsigned refund transaction template: spends the contract output back
/// to the client in full (minus fee), locked until `expiry`. Sequence 0 on
/// the input so the lock time is actually enforced.
pub fn build_refund_tx(
    contract_txid: Hash256,
    channel_value: u64,
    expiry: u64,
    client_script: &[u8],
) -> Transaction {
    let mut tx = Transaction::new();
    let mut input = TxIn::unsigned(OutPoint::new(contract_txid, 0));
    input.sequence = 0;
    tx.inputs.push(input);
    tx.outputs.push(TxOut::new(
        channel_value.saturating_sub(CHANNEL_TX_FEE),
        client_script.to_vec(),
    ));
    tx.lock_time = expiry as u32;
    tx
}

/// Range check shared by both machines when a channel is proposed.
pub fn check_channel_value(value: u64) -> Result<(), ChannelError> {
    if value < MIN_CHANNEL_VALUE {
        return Err(ChannelError::ValueOutOfRange(format!(
            "channel value {} below minimum {}",
            value, MIN_CHANNEL_VALUE
        )));
    }
    if value > MAX_MONEY {
        return Err(ChannelError::ValueOutOfRange(format!(
            "channel value {} exceeds maximum money",
            value
        )));
    }
    Ok(())
}

/// Range check on a proposed cumulative server share: it must buy an
/// actual spendable output, and leave the flat fee in the channel. Both
/// machines apply it, so a settlement transaction always pays the server
/// above dust and never comes out zero-fee.
pub fn check_payment_value(value_to_server: u64, channel_value: u64) -> Result<(), ChannelError> {
    if value_to_server <= DUST_LIMIT {
        return Err(ChannelError::ValueOutOfRange(format!(
            "payment {} not above dust limit {}",
            value_to_server, DUST_LIMIT
        )));
    }
    let spendable = channel_value.saturating_sub(CHANNEL_TX_FEE);
    if value_to_server > spendable {
        return Err(ChannelError::ValueOutOfRange(format!(
            "payment {} exceeds spendable channel value {}",
            value_to_server, spendable
        )));
    }
    Ok(())
}

/// Structural check on a contract transaction's locked output.
pub fn check_contract_output(
    contract: &Transaction,
    expected_script: &[u8],
) -> Result<u64, VerificationError> {
    let output = contract
        .outputs
        .first()
        .ok_or_else(|| VerificationError::BadScript("contract has no outputs".to_string()))?;
    if output.script_pubkey != expected_script {
        return Err(VerificationError::BadScript(
            "contract output does not match negotiated channel script".to_string(),
        ));
    }
    if output.value == 0 {
        return Err(VerificationError::BadValue("contract locks zero value".to_string()));
    }
    Ok(output.value)
}

// =============================================================================
// Tests
// =============================================================================
