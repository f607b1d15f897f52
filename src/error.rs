// =============================================================================
// SATLINK v1.2 - Error Taxonomy
// =============================================================================
//
// Three error families with different blast radii:
//
// - ProtocolError:     malformed wire bytes. Fatal to the current parse;
//                      at the framer it kills the connection. Never retried.
// - VerificationError: signature / script / merkle-root mismatch. Fatal to
//                      the operation; a server channel moves to Error.
// - ChannelError:      channel-level failures. ValueOutOfRange and
//                      InsufficientFunds are recoverable by the caller,
//                      IllegalState is a programming-contract violation.
//
// =============================================================================

use std::fmt;

// =============================================================================
// ProtocolError
// =============================================================================

/// Malformed, truncated or oversized wire data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    /// Fewer bytes remained than the structure demands.
    Truncated { needed: usize, available: usize },
    /// Declared payload length exceeds the hard message cap.
    Oversized { declared: usize, max: usize },
    /// Network magic did not match the expected constant.
    BadMagic { found: [u8; 4] },
    /// Packet checksum did not match double-SHA256 of the payload.
    BadChecksum,
    /// Command field was not null-padded printable ASCII.
    BadCommand,
    /// Structurally invalid sub-field.
    Malformed(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Truncated { needed, available } => {
                write!(f, "truncated input: need {} bytes, have {}", needed, available)
            }
            ProtocolError::Oversized { declared, max } => {
                write!(f, "declared length {} exceeds maximum {}", declared, max)
            }
            ProtocolError::BadMagic { found } => {
                write!(f, "bad network magic: {}", hex::encode(found))
            }
            ProtocolError::BadChecksum => write!(f, "payload checksum mismatch"),
            ProtocolError::BadCommand => write!(f, "invalid command field"),
            ProtocolError::Malformed(s) => write!(f, "malformed message: {}", s),
        }
    }
}

impl std::error::Error for ProtocolError {}

// =============================================================================
// VerificationError
// =============================================================================

/// Cryptographic or structural verification failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerificationError {
    /// Reconstructed merkle root differs from the expected one.
    MerkleRootMismatch,
    /// Partial tree consumed more hashes than were provided.
    HashesExhausted,
    /// Partial tree consumed more flag bits than were provided.
    BitsExhausted,
    /// Leftover hashes / non-zero padding bits / tx count inconsistent
    /// with the data actually present.
    InconsistentProof(String),
    /// ECDSA signature did not verify.
    BadSignature,
    /// Script did not match the expected locking conditions.
    BadScript(String),
    /// Locked or paid value failed a structural check.
    BadValue(String),
}

impl fmt::Display for VerificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationError::MerkleRootMismatch => write!(f, "merkle root mismatch"),
            VerificationError::HashesExhausted => write!(f, "ran out of hashes"),
            VerificationError::BitsExhausted => write!(f, "ran out of flag bits"),
            VerificationError::InconsistentProof(s) => write!(f, "inconsistent proof: {}", s),
            VerificationError::BadSignature => write!(f, "invalid signature"),
            VerificationError::BadScript(s) => write!(f, "script mismatch: {}", s),
            VerificationError::BadValue(s) => write!(f, "bad value: {}", s),
        }
    }
}

impl std::error::Error for VerificationError {}

// =============================================================================
// ChannelError
// =============================================================================

/// Failures surfaced by the payment channel state machines.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelError {
    /// Amount is zero, exceeds remaining capacity, or is below minimums.
    /// Recoverable: retry with an adjusted amount, state untouched.
    ValueOutOfRange(String),
    /// Operation invoked in a state that forbids it.
    IllegalState { state: String, operation: String },
    /// The wallet collaborator could not fund the requested value.
    /// Recoverable after funding the wallet.
    InsufficientFunds { needed: u64, available: u64 },
    /// Counterparty material failed verification.
    Verification(VerificationError),
    /// Wire-level failure bubbled up from parsing counterparty bytes.
    Protocol(ProtocolError),
    /// Persistence collaborator failure.
    Storage(String),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::ValueOutOfRange(s) => write!(f, "value out of range: {}", s),
            ChannelError::IllegalState { state, operation } => {
                write!(f, "illegal state {} for operation {}", state, operation)
            }
            ChannelError::InsufficientFunds { needed, available } => {
                write!(f, "insufficient funds: need {} sat, have {}", needed, available)
            }
            ChannelError::Verification(e) => write!(f, "verification failed: {}", e),
            ChannelError::Protocol(e) => write!(f, "protocol error: {}", e),
            ChannelError::Storage(s) => write!(f, "storage error: {}", s),
        }
    }
}

impl std::error::Error for ChannelError {}

impl From<VerificationError> for ChannelError {
    fn from(e: VerificationError) -> Self {
        ChannelError::Verification(e)
    }
}

impl From<ProtocolError> for ChannelError {
    fn from(e: ProtocolError) -> Self {
        ChannelError::Protocol(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_context() {
        let e = ProtocolError::Truncated { needed: 32, available: 4 };
        assert!(e.to_string().contains("32"));

        let e = ChannelError::InsufficientFunds { needed: 1000, available: 10 };
        assert!(e.to_string().contains("1000"));
    }

    #[test]
    fn test_conversions() {
        let e: ChannelError = VerificationError::BadSignature.into();
        assert!(matches!(e, ChannelError::Verification(_)));
    }
}
