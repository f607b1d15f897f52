// =============================================================================
// SATLINK v1.2 - Channel Messages
// =============================================================================
//
// The negotiation envelope exchanged between client and server sessions.
// The channel protocol rides over whatever transport the application
// chooses, so these are opaque structured records (serde + bincode), not
// consensus wire format. Transactions travel as consensus bytes inside
// them so both sides hash identical material.
//
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

use super::ChannelVersion;

/// One message of the channel negotiation protocol. The state machines
/// define what each variant means in each state; this type only carries it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ChannelMessage {
    /// Client opens: the protocol version it wants, its channel pubkey
    /// (33-byte SEC1 compressed), and the expiry it proposes.
    ClientVersion {
        version: ChannelVersion,
        client_key: Vec<u8>,
        expiry: u64,
    },
    /// Server accepts the version and announces its channel pubkey plus
    /// the minimum expiry margin it will tolerate.
    ServerVersion {
        version: ChannelVersion,
        server_key: Vec<u8>,
        min_expiry_delta: u64,
    },
    /// Client's unsigned refund template (consensus bytes) for the server
    /// to co-sign.
    ClientRefund {
        refund_tx: Vec<u8>,
        channel_value: u64,
    },
    /// Server's half-signature over the refund template.
    RefundSignature { signature: Vec<u8> },
    /// The fully built contract transaction, ready for broadcast.
    ProvideContract { contract_tx: Vec<u8> },
    /// A new payment split: cumulative value to the server and the
    /// client's signature over the matching payment transaction.
    UpdatePayment {
        value_to_server: u64,
        signature: Vec<u8>,
    },
    /// Server acknowledges the payment it just accepted.
    PaymentAck { value_to_server: u64 },
    /// Either side requests cooperative close.
    Close,
    /// Terminal failure report; the sender has moved to an error state.
    Error { message: String },
}

impl ChannelMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serialize(self)
            .map_err(|e| ProtocolError::Malformed(format!("channel message encode: {}", e)))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        bincode::deserialize(bytes)
            .map_err(|e| ProtocolError::Malformed(format!("channel message decode: {}", e)))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let msg = ChannelMessage::UpdatePayment {
            value_to_server: 42_000,
            signature: vec![0x30, 0x45, 0x02, 0x21],
        };
        let bytes = msg.encode().unwrap();
        assert_eq!(ChannelMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_all_variants_encode() {
        let msgs = vec![
            ChannelMessage::ClientVersion {
                version: ChannelVersion::V2,
                client_key: vec![0x02; 33],
                expiry: 1_700_000_000,
            },
            ChannelMessage::ServerVersion {
                version: ChannelVersion::V2,
                server_key: vec![0x03; 33],
                min_expiry_delta: 7_200,
            },
            ChannelMessage::ClientRefund { refund_tx: vec![1, 2, 3], channel_value: 50_000 },
            ChannelMessage::RefundSignature { signature: vec![0x30] },
            ChannelMessage::ProvideContract { contract_tx: vec![4, 5] },
            ChannelMessage::PaymentAck { value_to_server: 10 },
            ChannelMessage::Close,
            ChannelMessage::Error { message: "expired".to_string() },
        ];
        for msg in msgs {
            let bytes = msg.encode().unwrap();
            assert_eq!(ChannelMessage::decode(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(ChannelMessage::decode(&[0xFF; 3]).is_err());
    }
}
