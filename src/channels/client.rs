// =============================================================================
// SATLINK v1.2 - Channel Client
// =============================================================================
//
// Client side of the micropayment protocol. The client funds the contract,
// negotiates a timelocked refund it can broadcast alone after expiry, and
// then pays in increments by signing ever-larger server shares of the
// payment transaction. Its balance (value_to_me) only ever decreases.
//
//   UNINITIALISED → NEW → INITIATED → WAITING_FOR_SIGNED_REFUND
//     → SAVE_STATE_IN_WALLET → PROVIDE_MULTISIG_CONTRACT_TO_SERVER → READY
//     → { EXPIRED | CLOSED }
//
// The refund must be fully signed and persisted BEFORE the contract is
// revealed to the server: once the server sees the contract it could
// broadcast it, and without the refund the client's funds would depend on
// the server's continued cooperation.
//
// =============================================================================

use secp256k1::{PublicKey, Secp256k1, SecretKey};

use crate::error::{ChannelError, VerificationError};
use crate::script;
use crate::transaction::{Transaction, TxOut};
use crate::DUST_LIMIT;

use super::store::StoredChannel;
use super::{
    build_payment_tx, build_refund_tx, check_channel_value, check_payment_value, ChannelId,
    ChannelStore, ChannelVersion, WalletSource, CHANNEL_TX_FEE,
};

// =============================================================================
// States
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientChannelState {
    Uninitialised,
    New,
    Initiated,
    WaitingForSignedRefund,
    SaveStateInWallet,
    ProvideMultisigContractToServer,
    Ready,
    Expired,
    Closed,
}

/// The full legal transition set. Everything else is a contract violation.
fn valid_transition(from: ClientChannelState, to: ClientChannelState) -> bool {
    use ClientChannelState::*;
    matches!(
        (from, to),
        (Uninitialised, New)
            | (Uninitialised, Ready) // rehydration from storage
            | (New, Initiated)
            | (Initiated, WaitingForSignedRefund)
            | (WaitingForSignedRefund, SaveStateInWallet)
            | (SaveStateInWallet, ProvideMultisigContractToServer)
            | (ProvideMultisigContractToServer, Ready)
            | (Ready, Expired)
            | (Ready, Closed)
    )
}

// =============================================================================
// PaymentChannelClientState
// =============================================================================

pub struct PaymentChannelClientState {
    state: ClientChannelState,
    version: ChannelVersion,
    client_key: SecretKey,
    client_pubkey: PublicKey,
    server_pubkey: PublicKey,
    /// Total value locked in the contract output.
    channel_value: u64,
    /// Value still ours. Starts at channel_value, only decreases.
    value_to_me: u64,
    /// UNIX seconds after which the refund becomes broadcastable.
    expiry: u64,
    contract: Option<Transaction>,
    /// Refund template after initiate(); fully signed after
    /// provide_refund_signature().
    refund: Option<Transaction>,
    /// Our half-signature over the refund, kept to complete the scriptSig
    /// once the server's half arrives.
    client_refund_sig: Option<Vec<u8>>,
    /// Single-increment-in-flight guard.
    payment_in_progress: bool,
}

impl PaymentChannelClientState {
    pub fn new(
        client_key: SecretKey,
        server_pubkey: PublicKey,
        channel_value: u64,
        expiry: u64,
        version: ChannelVersion,
    ) -> Self {
        let secp = Secp256k1::new();
        let client_pubkey = PublicKey::from_secret_key(&secp, &client_key);
        PaymentChannelClientState {
            state: ClientChannelState::New,
            version,
            client_key,
            client_pubkey,
            server_pubkey,
            channel_value,
            value_to_me: channel_value,
            expiry,
            contract: None,
            refund: None,
            client_refund_sig: None,
            payment_in_progress: false,
        }
    }

    /// Rehydrates a channel persisted after negotiation. Enters READY
    /// directly with the stored balance; the refund record must carry the
    /// completed scriptSig, because recovery is the reason it was stored.
    pub fn from_stored(record: &StoredChannel) -> Result<Self, ChannelError> {
        let secp = Secp256k1::new();
        let client_key = SecretKey::from_slice(&record.my_key)
            .map_err(|_| ChannelError::Storage("stored client key invalid".to_string()))?;
        let server_pubkey = PublicKey::from_slice(&record.their_pubkey)
            .map_err(|_| ChannelError::Storage("stored server key invalid".to_string()))?;
        let contract = Transaction::parse(&record.contract)?;
        let refund = Transaction::parse(&record.refund)?;
        if refund.inputs.first().map_or(true, |i| i.script_sig.is_empty()) {
            return Err(ChannelError::Storage("stored refund is unsigned".to_string()));
        }
        Ok(PaymentChannelClientState {
            state: ClientChannelState::Ready,
            version: record.version,
            client_pubkey: PublicKey::from_secret_key(&secp, &client_key),
            client_key,
            server_pubkey,
            channel_value: record.channel_value,
            value_to_me: record.value_to_me,
            expiry: record.expiry,
            contract: Some(contract),
            refund: Some(refund),
            client_refund_sig: None,
            payment_in_progress: false,
        })
    }

    // =========================================================================
    // Negotiation
    // =========================================================================

    /// Builds and signs the contract transaction locking `channel_value`,
    /// plus the timelocked refund template, signing only our half of the
    /// refund. The contract is NOT revealed yet.
    pub fn initiate(&mut self, wallet: &mut dyn WalletSource) -> Result<(), ChannelError> {
        self.require_state(ClientChannelState::New, "initiate")?;
        check_channel_value(self.channel_value)?;

        let target = self.channel_value + CHANNEL_TX_FEE;
        let (inputs, total_in) = wallet.fund(target)?;
        if total_in < target {
            return Err(ChannelError::InsufficientFunds { needed: target, available: total_in });
        }

        let mut contract = Transaction::new();
        contract.inputs = inputs;
        contract.outputs.push(TxOut::new(self.channel_value, self.contract_script()));
        let change = total_in - target;
        if change > DUST_LIMIT {
            contract.outputs.push(TxOut::new(change, wallet.change_script()));
        }
        for index in 0..contract.inputs.len() {
            wallet.sign_input(&mut contract, index)?;
        }

        let refund = build_refund_tx(
            contract.txid(),
            self.channel_value,
            self.expiry,
            &wallet.change_script(),
        );
        let digest = refund.signature_hash(0, &self.script_code())?;
        self.client_refund_sig = Some(script::sign_digest(&self.client_key, &digest));

        self.contract = Some(contract);
        self.refund = Some(refund);
        self.transition(ClientChannelState::Initiated, "initiate")
    }

    /// Combines the server's refund signature with ours, verifying both
    /// against the contract's locking conditions, and completes the
    /// refund's scriptSig. After this the refund is broadcastable once
    /// the timelock passes, whatever the server does.
    pub fn provide_refund_signature(&mut self, server_sig: &[u8]) -> Result<(), ChannelError> {
        self.require_state(ClientChannelState::Initiated, "provide_refund_signature")?;

        let script_code = self.script_code();
        let refund = self.refund.as_mut().ok_or_else(|| ChannelError::Storage(
            "refund template missing".to_string(),
        ))?;
        let digest = refund.signature_hash(0, &script_code)?;
        script::verify_digest(&self.server_pubkey, &digest, server_sig)?;

        let client_sig = self.client_refund_sig.as_deref().ok_or(
            ChannelError::Verification(VerificationError::BadSignature),
        )?;
        script::verify_digest(&self.client_pubkey, &digest, client_sig)?;

        refund.inputs[0].script_sig = self.version.cooperative_script_sig(
            client_sig,
            server_sig,
            &self.client_pubkey,
            &self.server_pubkey,
            self.expiry,
        );
        // Only move once the refund is actually broadcastable: a bad
        // signature leaves the channel at INITIATED, where the server's
        // corrected signature can still be applied.
        self.transition(ClientChannelState::WaitingForSignedRefund, "provide_refund_signature")?;
        self.transition(ClientChannelState::SaveStateInWallet, "provide_refund_signature")
    }

    /// Persists the channel. Must run before the contract leaves this
    /// process so a crash can still reach the refund path.
    pub fn save_to_wallet(&mut self, store: &dyn ChannelStore) -> Result<(), ChannelError> {
        self.require_state(ClientChannelState::SaveStateInWallet, "save_to_wallet")?;
        let id = self.channel_id()?;
        let record = self.to_stored()?;
        store.put(&id, &record)?;
        self.transition(ClientChannelState::ProvideMultisigContractToServer, "save_to_wallet")
    }

    /// Hands the contract over for transmission to the server and enters
    /// READY.
    pub fn contract_for_server(&mut self) -> Result<Transaction, ChannelError> {
        self.require_state(
            ClientChannelState::ProvideMultisigContractToServer,
            "contract_for_server",
        )?;
        let contract = self
            .contract
            .clone()
            .ok_or_else(|| ChannelError::Storage("contract missing".to_string()))?;
        self.transition(ClientChannelState::Ready, "contract_for_server")?;
        Ok(contract)
    }

    // =========================================================================
    // Payments
    // =========================================================================

    /// Pays the server `amount` more satoshis: moves the split, rebuilds
    /// the payment transaction and returns the new cumulative server value
    /// with our signature over it. Exactly one increment may be in flight;
    /// the ack clears the guard.
    pub fn increment_payment(&mut self, amount: u64) -> Result<(u64, Vec<u8>), ChannelError> {
        self.require_state(ClientChannelState::Ready, "increment_payment")?;
        if self.payment_in_progress {
            return Err(ChannelError::IllegalState {
                state: "Ready (payment in flight)".to_string(),
                operation: "increment_payment".to_string(),
            });
        }
        if amount == 0 {
            return Err(ChannelError::ValueOutOfRange("increment of zero".to_string()));
        }
        if amount > self.value_to_me {
            return Err(ChannelError::ValueOutOfRange(format!(
                "increment {} exceeds remaining channel value {}",
                amount, self.value_to_me
            )));
        }
        let value_to_server = self.channel_value - (self.value_to_me - amount);
        check_payment_value(value_to_server, self.channel_value)?;

        self.value_to_me -= amount;

        let payment = self.build_payment(value_to_server)?;
        let digest = payment.signature_hash(0, &self.script_code())?;
        let signature = script::sign_digest(&self.client_key, &digest);

        self.payment_in_progress = true;
        Ok((value_to_server, signature))
    }

    /// Server acknowledged the increment; the next one may proceed.
    pub fn payment_acked(&mut self) {
        self.payment_in_progress = false;
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expiry
    }

    /// Marks the channel expired and yields the fully signed refund for
    /// unilateral broadcast.
    pub fn expire(&mut self) -> Result<Transaction, ChannelError> {
        self.require_state(ClientChannelState::Ready, "expire")?;
        let refund = self
            .refund
            .clone()
            .ok_or_else(|| ChannelError::Storage("refund missing".to_string()))?;
        self.transition(ClientChannelState::Expired, "expire")?;
        Ok(refund)
    }

    /// Cooperative close: the server settles with its best payment tx.
    pub fn close(&mut self) -> Result<(), ChannelError> {
        self.require_state(ClientChannelState::Ready, "close")?;
        self.transition(ClientChannelState::Closed, "close")
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn state(&self) -> ClientChannelState {
        self.state
    }

    pub fn value_to_me(&self) -> u64 {
        self.value_to_me
    }

    pub fn value_to_server(&self) -> u64 {
        self.channel_value - self.value_to_me
    }

    pub fn refund_transaction(&self) -> Option<&Transaction> {
        self.refund.as_ref()
    }

    /// Unsigned refund template for the server to co-sign.
    pub fn refund_template(&self) -> Result<Transaction, ChannelError> {
        let refund = self
            .refund
            .as_ref()
            .ok_or_else(|| ChannelError::Storage("refund missing".to_string()))?;
        let mut template = refund.clone();
        template.inputs[0].script_sig = Vec::new();
        Ok(template)
    }

    pub fn channel_id(&self) -> Result<ChannelId, ChannelError> {
        let contract = self
            .contract
            .as_ref()
            .ok_or_else(|| ChannelError::Storage("contract missing".to_string()))?;
        Ok(ChannelId::from_contract(contract))
    }

    pub fn to_stored(&self) -> Result<StoredChannel, ChannelError> {
        let contract = self
            .contract
            .as_ref()
            .ok_or_else(|| ChannelError::Storage("contract missing".to_string()))?;
        let refund = self
            .refund
            .as_ref()
            .ok_or_else(|| ChannelError::Storage("refund missing".to_string()))?;
        Ok(StoredChannel {
            version: self.version,
            contract: contract.serialize(),
            refund: refund.serialize(),
            my_key: self.client_key.secret_bytes().to_vec(),
            their_pubkey: self.server_pubkey.serialize().to_vec(),
            channel_value: self.channel_value,
            value_to_me: self.value_to_me,
            expiry: self.expiry,
            best_signature: None,
        })
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn contract_script(&self) -> Vec<u8> {
        self.version
            .contract_script(&self.client_pubkey, &self.server_pubkey, self.expiry)
    }

    fn script_code(&self) -> Vec<u8> {
        self.version
            .script_code(&self.client_pubkey, &self.server_pubkey, self.expiry)
    }

    fn build_payment(&self, value_to_server: u64) -> Result<Transaction, ChannelError> {
        let contract = self
            .contract
            .as_ref()
            .ok_or_else(|| ChannelError::Storage("contract missing".to_string()))?;
        Ok(build_payment_tx(
            contract.txid(),
            self.channel_value,
            value_to_server,
            &script::p2pkh_script(&self.server_pubkey),
            &script::p2pkh_script(&self.client_pubkey),
        ))
    }

    fn require_state(
        &self,
        expected: ClientChannelState,
        operation: &str,
    ) -> Result<(), ChannelError> {
        if self.state != expected {
            return Err(ChannelError::IllegalState {
                state: format!("{:?}", self.state),
                operation: operation.to_string(),
            });
        }
        Ok(())
    }

    fn transition(&mut self, to: ClientChannelState, operation: &str) -> Result<(), ChannelError> {
        if !valid_transition(self.state, to) {
            return Err(ChannelError::IllegalState {
                state: format!("{:?}", self.state),
                operation: operation.to_string(),
            });
        }
        self.state = to;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
