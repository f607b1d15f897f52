// =============================================================================
// SATLINK v1.2 - Channel Server
// =============================================================================
//
// Server side of the micropayment protocol. The server co-signs the
// client's refund (never broadcasting it), verifies and broadcasts the
// contract, then accepts payment signatures whose server share strictly
// increases. It signs nothing else until close, so the client can never
// spend the locked value without the server's cooperation or expiry.
//
//   UNINITIALISED → WAITING_FOR_REFUND_TRANSACTION
//     → WAITING_FOR_MULTISIG_CONTRACT → WAITING_FOR_MULTISIG_ACCEPTANCE
//     → READY → CLOSING → CLOSED          (any state → ERROR)
//
// Rollback protection: best_value_to_me is monotonically increasing; a
// payment at or below it is rejected with a value error and no state
// change. Verification failures are different — they mean the
// counterparty is broken or hostile, and the channel moves to ERROR.
//
// =============================================================================

use secp256k1::{PublicKey, Secp256k1, SecretKey};
use tokio::sync::oneshot;

use crate::error::{ChannelError, VerificationError};
use crate::script;
use crate::transaction::{Transaction, SEQUENCE_FINAL};

use super::store::StoredChannel;
use super::{
    build_payment_tx, check_contract_output, check_payment_value, ChannelId, ChannelVersion,
    TxBroadcaster,
};

// =============================================================================
// States
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerChannelState {
    Uninitialised,
    WaitingForRefundTransaction,
    WaitingForMultisigContract,
    WaitingForMultisigAcceptance,
    Ready,
    Closing,
    Closed,
    Error,
}

fn valid_transition(from: ServerChannelState, to: ServerChannelState) -> bool {
    use ServerChannelState::*;
    if to == Error {
        return true;
    }
    matches!(
        (from, to),
        (Uninitialised, WaitingForRefundTransaction)
            | (Uninitialised, Ready) // rehydration from storage
            | (WaitingForRefundTransaction, WaitingForMultisigContract)
            | (WaitingForMultisigContract, WaitingForMultisigAcceptance)
            | (WaitingForMultisigAcceptance, Ready)
            | (Ready, Closing)
            | (Closing, Closed)
    )
}

// =============================================================================
// PaymentChannelServerState
// =============================================================================

pub struct PaymentChannelServerState {
    state: ServerChannelState,
    version: ChannelVersion,
    server_key: SecretKey,
    server_pubkey: PublicKey,
    client_pubkey: PublicKey,
    /// Channel expiry agreed during version negotiation; the refund's
    /// lock time must equal it.
    expiry: u64,
    /// Earliest acceptable expiry (absolute UNIX seconds). Anything
    /// sooner leaves no room to settle before the client can refund.
    min_expiry: u64,
    /// Learned from the contract's locked output.
    channel_value: u64,
    contract: Option<Transaction>,
    /// Highest server share accepted so far. Only increases.
    best_value_to_me: u64,
    /// Client signature matching best_value_to_me.
    best_signature: Option<Vec<u8>>,
}

impl PaymentChannelServerState {
    pub fn new(
        server_key: SecretKey,
        client_pubkey: PublicKey,
        expiry: u64,
        min_expiry: u64,
        version: ChannelVersion,
    ) -> Self {
        let secp = Secp256k1::new();
        let server_pubkey = PublicKey::from_secret_key(&secp, &server_key);
        PaymentChannelServerState {
            state: ServerChannelState::WaitingForRefundTransaction,
            version,
            server_key,
            server_pubkey,
            client_pubkey,
            expiry,
            min_expiry,
            channel_value: 0,
            contract: None,
            best_value_to_me: 0,
            best_signature: None,
        }
    }

    /// Rehydrates a persisted server channel straight into READY so it can
    /// keep accepting payments or settle.
    pub fn from_stored(record: &StoredChannel) -> Result<Self, ChannelError> {
        let secp = Secp256k1::new();
        let server_key = SecretKey::from_slice(&record.my_key)
            .map_err(|_| ChannelError::Storage("stored server key invalid".to_string()))?;
        let client_pubkey = PublicKey::from_slice(&record.their_pubkey)
            .map_err(|_| ChannelError::Storage("stored client key invalid".to_string()))?;
        let contract = Transaction::parse(&record.contract)?;
        Ok(PaymentChannelServerState {
            state: ServerChannelState::Ready,
            version: record.version,
            server_pubkey: PublicKey::from_secret_key(&secp, &server_key),
            server_key,
            client_pubkey,
            expiry: record.expiry,
            min_expiry: 0,
            channel_value: record.channel_value,
            contract: Some(contract),
            best_value_to_me: record.value_to_me,
            best_signature: record.best_signature.clone(),
        })
    }

    // =========================================================================
    // Negotiation
    // =========================================================================

    /// Co-signs the client's refund template, returning only the
    /// signature. The template must be locked to the negotiated expiry,
    /// with that expiry far enough out, and the lock actually enforced.
    pub fn sign_refund(&mut self, template: &Transaction) -> Result<Vec<u8>, ChannelError> {
        self.require_state(ServerChannelState::WaitingForRefundTransaction, "sign_refund")?;

        if template.inputs.len() != 1 {
            return self.fail(VerificationError::BadValue(format!(
                "refund has {} inputs, expected 1",
                template.inputs.len()
            )));
        }
        if template.inputs[0].sequence == SEQUENCE_FINAL {
            return self.fail(VerificationError::BadValue(
                "refund sequence is final, lock time not enforced".to_string(),
            ));
        }
        if u64::from(template.lock_time) != self.expiry {
            return self.fail(VerificationError::BadValue(format!(
                "refund locked to {}, negotiated expiry is {}",
                template.lock_time, self.expiry
            )));
        }
        if self.expiry < self.min_expiry {
            return self.fail(VerificationError::BadValue(format!(
                "expiry {} sooner than minimum {}",
                self.expiry, self.min_expiry
            )));
        }

        let digest = template.signature_hash(0, &self.script_code())?;
        let signature = script::sign_digest(&self.server_key, &digest);
        self.transition(ServerChannelState::WaitingForMultisigContract, "sign_refund")?;
        Ok(signature)
    }

    /// Verifies the contract's locked output and hands it to the
    /// broadcaster. The returned receiver resolves on confirmation and
    /// never resolves if the network drops the transaction; the caller
    /// owns the timeout, then `contract_confirmed()` completes the step.
    pub fn provide_contract(
        &mut self,
        contract: Transaction,
        broadcaster: &dyn TxBroadcaster,
    ) -> Result<oneshot::Receiver<Transaction>, ChannelError> {
        self.require_state(ServerChannelState::WaitingForMultisigContract, "provide_contract")?;

        let expected = self
            .version
            .contract_script(&self.client_pubkey, &self.server_pubkey, self.expiry);
        let value = match check_contract_output(&contract, &expected) {
            Ok(value) => value,
            Err(e) => return self.fail(e),
        };
        if let Err(e) = contract.check_values() {
            return self.fail(e);
        }

        self.channel_value = value;
        let receiver = broadcaster.broadcast(&contract);
        self.contract = Some(contract);
        self.transition(ServerChannelState::WaitingForMultisigAcceptance, "provide_contract")?;
        Ok(receiver)
    }

    /// The contract confirmed on-chain; payments may begin.
    pub fn contract_confirmed(&mut self) -> Result<(), ChannelError> {
        self.require_state(
            ServerChannelState::WaitingForMultisigAcceptance,
            "contract_confirmed",
        )?;
        self.transition(ServerChannelState::Ready, "contract_confirmed")
    }

    // =========================================================================
    // Payments
    // =========================================================================

    /// Accepts a payment only if the server share strictly increased and
    /// the signature verifies over the deterministically rebuilt payment
    /// transaction. A stale or decreasing value is a recoverable value
    /// error with no state change; a bad signature errors the channel.
    pub fn increment_payment(
        &mut self,
        value_to_server: u64,
        signature: &[u8],
    ) -> Result<(), ChannelError> {
        self.require_state(ServerChannelState::Ready, "increment_payment")?;

        if value_to_server <= self.best_value_to_me {
            return Err(ChannelError::ValueOutOfRange(format!(
                "payment {} does not exceed accepted best {}",
                value_to_server, self.best_value_to_me
            )));
        }
        check_payment_value(value_to_server, self.channel_value)?;

        let payment = self.build_payment(value_to_server)?;
        let digest = payment.signature_hash(0, &self.script_code())?;
        if let Err(e) = script::verify_digest(&self.client_pubkey, &digest, signature) {
            return self.fail(e);
        }

        self.best_value_to_me = value_to_server;
        self.best_signature = Some(signature.to_vec());
        Ok(())
    }

    // =========================================================================
    // Close
    // =========================================================================

    /// Settles the channel: completes the best payment transaction with
    /// our own signature and broadcasts it. `close_confirmed()` finishes
    /// the transition once the settlement confirms.
    pub fn close(
        &mut self,
        broadcaster: &dyn TxBroadcaster,
    ) -> Result<oneshot::Receiver<Transaction>, ChannelError> {
        self.require_state(ServerChannelState::Ready, "close")?;
        let client_sig = self.best_signature.clone().ok_or_else(|| {
            ChannelError::IllegalState {
                state: "Ready (no payment accepted)".to_string(),
                operation: "close".to_string(),
            }
        })?;

        let mut payment = self.build_payment(self.best_value_to_me)?;
        let digest = payment.signature_hash(0, &self.script_code())?;
        let server_sig = script::sign_digest(&self.server_key, &digest);
        payment.inputs[0].script_sig = self.version.cooperative_script_sig(
            &client_sig,
            &server_sig,
            &self.client_pubkey,
            &self.server_pubkey,
            self.expiry,
        );

        let receiver = broadcaster.broadcast(&payment);
        self.transition(ServerChannelState::Closing, "close")?;
        Ok(receiver)
    }

    pub fn close_confirmed(&mut self) -> Result<(), ChannelError> {
        self.require_state(ServerChannelState::Closing, "close_confirmed")?;
        self.transition(ServerChannelState::Closed, "close_confirmed")
    }

    /// Connection loss, broadcast timeout, or counterparty error report:
    /// the channel is dead and the client falls back to the refund path.
    pub fn mark_error(&mut self) {
        self.state = ServerChannelState::Error;
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn state(&self) -> ServerChannelState {
        self.state
    }

    pub fn best_value_to_me(&self) -> u64 {
        self.best_value_to_me
    }

    pub fn channel_value(&self) -> u64 {
        self.channel_value
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
        Ok(StoredChannel {
            version: self.version,
            contract: contract.serialize(),
            refund: Vec::new(),
            my_key: self.server_key.secret_bytes().to_vec(),
            their_pubkey: self.client_pubkey.serialize().to_vec(),
            channel_value: self.channel_value,
            value_to_me: self.best_value_to_me,
            expiry: self.expiry,
            best_signature: self.best_signature.clone(),
        })
    }

    // =========================================================================
    // Internals
    // =========================================================================

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

    /// Verification failure: the channel moves to ERROR and stays there.
    fn fail<T>(&mut self, error: VerificationError) -> Result<T, ChannelError> {
        self.state = ServerChannelState::Error;
        Err(ChannelError::Verification(error))
    }

    fn require_state(
        &self,
        expected: ServerChannelState,
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

    fn transition(&mut self, to: ServerChannelState, operation: &str) -> Result<(), ChannelError> {
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
