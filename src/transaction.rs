// =============================================================================
// SATLINK v1.2 - Transactions
// =============================================================================
//
// The transaction model the channel machinery builds and signs. Encoding is
// byte-exact consensus form (everything little-endian, varint-prefixed
// lists), because contract and refund transactions leave this process and
// must hash identically everywhere.
//
// =============================================================================

use crate::codec::{write_u32_le, write_u64_le, write_var_bytes, write_varint, ByteCursor};
use crate::error::{ProtocolError, VerificationError};
use crate::merkle::{double_sha256, Hash256};
use crate::{MAX_MONEY, MAX_SIZE};

/// Sequence value that disables lock-time enforcement for an input.
pub const SEQUENCE_FINAL: u32 = 0xFFFF_FFFF;

/// SIGHASH_ALL: the signature commits to all inputs and outputs.
pub const SIGHASH_ALL: u32 = 1;

// =============================================================================
// OutPoint / TxIn / TxOut
// =============================================================================

/// Reference to an output of a previous transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutPoint {
    pub txid: Hash256,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: Hash256, vout: u32) -> Self {
        OutPoint { txid, vout }
    }

    pub fn read(cursor: &mut ByteCursor) -> Result<Self, ProtocolError> {
        Ok(OutPoint { txid: cursor.read_hash()?, vout: cursor.read_u32_le()? })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.txid);
        write_u32_le(out, self.vout);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxIn {
    pub previous_output: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxIn {
    /// Unsigned input spending `previous_output`.
    pub fn unsigned(previous_output: OutPoint) -> Self {
        TxIn { previous_output, script_sig: Vec::new(), sequence: SEQUENCE_FINAL }
    }

    pub fn read(cursor: &mut ByteCursor) -> Result<Self, ProtocolError> {
        Ok(TxIn {
            previous_output: OutPoint::read(cursor)?,
            script_sig: cursor.read_var_bytes()?,
            sequence: cursor.read_u32_le()?,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        self.previous_output.write(out);
        write_var_bytes(out, &self.script_sig);
        write_u32_le(out, self.sequence);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOut {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    pub fn new(value: u64, script_pubkey: Vec<u8>) -> Self {
        TxOut { value, script_pubkey }
    }

    pub fn read(cursor: &mut ByteCursor) -> Result<Self, ProtocolError> {
        Ok(TxOut { value: cursor.read_u64_le()?, script_pubkey: cursor.read_var_bytes()? })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        write_u64_le(out, self.value);
        write_var_bytes(out, &self.script_pubkey);
    }
}

// =============================================================================
// Transaction
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    /// Block height or UNIX time before which this tx is invalid, if any
    /// input has a non-final sequence.
    pub lock_time: u32,
}

impl Transaction {
    pub fn new() -> Self {
        Transaction { version: 1, inputs: Vec::new(), outputs: Vec::new(), lock_time: 0 }
    }

    pub fn read(cursor: &mut ByteCursor) -> Result<Self, ProtocolError> {
        let version = cursor.read_u32_le()?;

        let input_count = cursor.read_varint()? as usize;
        // Smallest possible input is 41 bytes; a larger count is a lie.
        if input_count > MAX_SIZE / 41 {
            return Err(ProtocolError::Oversized { declared: input_count, max: MAX_SIZE / 41 });
        }
        let mut inputs = Vec::with_capacity(input_count);
        for _ in 0..input_count {
            inputs.push(TxIn::read(cursor)?);
        }

        let output_count = cursor.read_varint()? as usize;
        if output_count > MAX_SIZE / 9 {
            return Err(ProtocolError::Oversized { declared: output_count, max: MAX_SIZE / 9 });
        }
        let mut outputs = Vec::with_capacity(output_count);
        for _ in 0..output_count {
            outputs.push(TxOut::read(cursor)?);
        }

        let lock_time = cursor.read_u32_le()?;
        Ok(Transaction { version, inputs, outputs, lock_time })
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = ByteCursor::new(bytes, 0);
        let tx = Transaction::read(&mut cursor)?;
        if cursor.remaining() != 0 {
            return Err(ProtocolError::Malformed("trailing bytes after transaction".to_string()));
        }
        Ok(tx)
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        write_u32_le(out, self.version);
        write_varint(out, self.inputs.len() as u64);
        for input in &self.inputs {
            input.write(out);
        }
        write_varint(out, self.outputs.len() as u64);
        for output in &self.outputs {
            output.write(out);
        }
        write_u32_le(out, self.lock_time);
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write(&mut out);
        out
    }

    /// Double SHA256 of the serialized transaction.
    pub fn txid(&self) -> Hash256 {
        double_sha256(&self.serialize())
    }

    pub fn output_sum(&self) -> u64 {
        self.outputs.iter().map(|o| o.value).sum()
    }

    /// Structural money sanity: no output, and no total, above MAX_MONEY.
    pub fn check_values(&self) -> Result<(), VerificationError> {
        let mut total: u64 = 0;
        for output in &self.outputs {
            if output.value > MAX_MONEY {
                return Err(VerificationError::BadValue(format!(
                    "output value {} exceeds maximum",
                    output.value
                )));
            }
            total = total.checked_add(output.value).ok_or_else(|| {
                VerificationError::BadValue("output total overflows".to_string())
            })?;
        }
        if total > MAX_MONEY {
            return Err(VerificationError::BadValue(format!(
                "output total {} exceeds maximum",
                total
            )));
        }
        Ok(())
    }

    /// Whether the lock-time field is actually enforced: it only counts if
    /// some input carries a non-final sequence.
    pub fn is_time_locked(&self) -> bool {
        self.lock_time > 0 && self.inputs.iter().any(|i| i.sequence != SEQUENCE_FINAL)
    }

    /// Legacy SIGHASH_ALL digest for signing `input_index` against
    /// `script_code` (the locking script, or the redeem script for P2SH):
    /// every scriptSig blanked, the signed input carrying the script code,
    /// the hash type appended.
    pub fn signature_hash(
        &self,
        input_index: usize,
        script_code: &[u8],
    ) -> Result<Hash256, VerificationError> {
        if input_index >= self.inputs.len() {
            return Err(VerificationError::BadValue(format!(
                "input index {} out of range",
                input_index
            )));
        }

        let mut copy = self.clone();
        for input in &mut copy.inputs {
            input.script_sig = Vec::new();
        }
        copy.inputs[input_index].script_sig = script_code.to_vec();

        let mut bytes = copy.serialize();
        write_u32_le(&mut bytes, SIGHASH_ALL);
        Ok(double_sha256(&bytes))
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Transaction::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
