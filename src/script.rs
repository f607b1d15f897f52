// =============================================================================
// SATLINK v1.2 - Contract Scripts
// =============================================================================
//
// Script *construction and comparison* only -- no interpreter. The channel
// protocol needs exactly four locking shapes:
//
//   2-of-2 multisig:   OP_2 <client> <server> OP_2 OP_CHECKMULTISIG
//   CLTV redeem:       OP_IF  2-of-2 multisig
//                      OP_ELSE <expiry> OP_CLTV OP_DROP <client> OP_CHECKSIG
//                      OP_ENDIF
//   P2SH wrapper:      OP_HASH160 <hash160(redeem)> OP_EQUAL
//   P2PKH:             OP_DUP OP_HASH160 <hash160(pk)> OP_EQUALVERIFY OP_CHECKSIG
//
// Plus the ECDSA helpers to produce and check the signatures those scripts
// demand (DER with the sighash byte appended, Bitcoin style).
//
// =============================================================================

use ripemd::Ripemd160;
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};

use crate::error::VerificationError;
use crate::merkle::Hash256;
use crate::transaction::SIGHASH_ALL;

// =============================================================================
// Opcodes
// =============================================================================

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4C;
pub const OP_PUSHDATA2: u8 = 0x4D;
pub const OP_1: u8 = 0x51;
pub const OP_2: u8 = 0x52;
pub const OP_16: u8 = 0x60;
pub const OP_IF: u8 = 0x63;
pub const OP_ELSE: u8 = 0x67;
pub const OP_ENDIF: u8 = 0x68;
pub const OP_DROP: u8 = 0x75;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xA9;
pub const OP_CHECKSIG: u8 = 0xAC;
pub const OP_CHECKMULTISIG: u8 = 0xAE;
pub const OP_CHECKLOCKTIMEVERIFY: u8 = 0xB1;

// =============================================================================
// Hashes
// =============================================================================

/// RIPEMD160(SHA256(data)) -- the script-hash / pubkey-hash primitive.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let mut out = [0u8; 20];
    out.copy_from_slice(&Ripemd160::digest(sha));
    out
}

// =============================================================================
// Building blocks
// =============================================================================

/// Appends a minimal push of `data`.
pub fn push_data(out: &mut Vec<u8>, data: &[u8]) {
    let len = data.len();
    if len < OP_PUSHDATA1 as usize {
        out.push(len as u8);
    } else if len <= 0xFF {
        out.push(OP_PUSHDATA1);
        out.push(len as u8);
    } else {
        out.push(OP_PUSHDATA2);
        out.extend_from_slice(&(len as u16).to_le_bytes());
    }
    out.extend_from_slice(data);
}

/// Minimal little-endian script-number encoding (sign bit in the top bit
/// of the last byte).
pub fn encode_script_number(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let negative = value < 0;
    let mut abs = value.unsigned_abs();
    let mut out = Vec::new();
    while abs > 0 {
        out.push((abs & 0xFF) as u8);
        abs >>= 8;
    }
    if out.last().copied().unwrap_or(0) & 0x80 != 0 {
        out.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        let last = out.len() - 1;
        out[last] |= 0x80;
    }
    out
}

/// Appends a push of a numeric value, using the small-integer opcodes
/// where possible.
pub fn push_number(out: &mut Vec<u8>, value: i64) {
    if value == 0 {
        out.push(OP_0);
    } else if (1..=16).contains(&value) {
        out.push(OP_1 + (value as u8) - 1);
    } else {
        let encoded = encode_script_number(value);
        push_data(out, &encoded);
    }
}

// =============================================================================
// Locking scripts
// =============================================================================

/// Raw 2-of-2 multisig over the channel keys (protocol v1 contract output).
pub fn multisig_2of2(client: &PublicKey, server: &PublicKey) -> Vec<u8> {
    let mut script = Vec::with_capacity(71);
    script.push(OP_2);
    push_data(&mut script, &client.serialize());
    push_data(&mut script, &server.serialize());
    script.push(OP_2);
    script.push(OP_CHECKMULTISIG);
    script
}

/// CLTV redeem script (protocol v2): cooperative 2-of-2 branch, or the
/// client alone after `expiry` (UNIX seconds).
pub fn cltv_redeem_script(client: &PublicKey, server: &PublicKey, expiry: u64) -> Vec<u8> {
    let mut script = Vec::new();
    script.push(OP_IF);
    script.push(OP_2);
    push_data(&mut script, &client.serialize());
    push_data(&mut script, &server.serialize());
    script.push(OP_2);
    script.push(OP_CHECKMULTISIG);
    script.push(OP_ELSE);
    push_number(&mut script, expiry as i64);
    script.push(OP_CHECKLOCKTIMEVERIFY);
    script.push(OP_DROP);
    push_data(&mut script, &client.serialize());
    script.push(OP_CHECKSIG);
    script.push(OP_ENDIF);
    script
}

/// P2SH wrapper around a redeem script.
pub fn p2sh_script(redeem: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(23);
    script.push(OP_HASH160);
    push_data(&mut script, &hash160(redeem));
    script.push(OP_EQUAL);
    script
}

/// Standard pay-to-pubkey-hash output.
pub fn p2pkh_script(pubkey: &PublicKey) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.push(OP_DUP);
    script.push(OP_HASH160);
    push_data(&mut script, &hash160(&pubkey.serialize()));
    script.push(OP_EQUALVERIFY);
    script.push(OP_CHECKSIG);
    script
}

// =============================================================================
// Unlocking scripts
// =============================================================================

/// scriptSig spending a raw 2-of-2 multisig output. The leading OP_0 feeds
/// the extra element CHECKMULTISIG pops.
pub fn multisig_script_sig(sig_client: &[u8], sig_server: &[u8]) -> Vec<u8> {
    let mut script = Vec::new();
    script.push(OP_0);
    push_data(&mut script, sig_client);
    push_data(&mut script, sig_server);
    script
}

/// scriptSig spending the cooperative branch of a CLTV redeem script
/// wrapped in P2SH: sigs, OP_1 to take the IF branch, then the redeem
/// script itself.
pub fn cltv_multisig_script_sig(sig_client: &[u8], sig_server: &[u8], redeem: &[u8]) -> Vec<u8> {
    let mut script = Vec::new();
    script.push(OP_0);
    push_data(&mut script, sig_client);
    push_data(&mut script, sig_server);
    script.push(OP_1);
    push_data(&mut script, redeem);
    script
}

// =============================================================================
// ECDSA over transaction digests
// =============================================================================

/// Signs a 32-byte digest; returns DER plus the appended sighash byte,
/// the form scripts carry.
pub fn sign_digest(key: &SecretKey, digest: &Hash256) -> Vec<u8> {
    let secp = Secp256k1::new();
    let msg = Message::from_digest(*digest);
    let mut sig = secp.sign_ecdsa(&msg, key).serialize_der().to_vec();
    sig.push(SIGHASH_ALL as u8);
    sig
}

/// Verifies a DER+sighash-byte signature over a digest.
pub fn verify_digest(
    pubkey: &PublicKey,
    digest: &Hash256,
    signature: &[u8],
) -> Result<(), VerificationError> {
    if signature.len() < 9 {
        return Err(VerificationError::BadSignature);
    }
    let der = &signature[..signature.len() - 1];
    let sig = Signature::from_der(der).map_err(|_| VerificationError::BadSignature)?;
    let secp = Secp256k1::new();
    secp.verify_ecdsa(&Message::from_digest(*digest), &sig, pubkey)
        .map_err(|_| VerificationError::BadSignature)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::rand::thread_rng;

    fn keypair() -> (SecretKey, PublicKey) {
        let secp = Secp256k1::new();
        let sk = SecretKey::new(&mut thread_rng());
        (sk, PublicKey::from_secret_key(&secp, &sk))
    }

    #[test]
    fn test_script_number_encoding() {
        assert_eq!(encode_script_number(0), Vec::<u8>::new());
        assert_eq!(encode_script_number(1), vec![0x01]);
        assert_eq!(encode_script_number(127), vec![0x7F]);
        // 128 needs a padding byte so the sign bit stays clear
        assert_eq!(encode_script_number(128), vec![0x80, 0x00]);
        assert_eq!(encode_script_number(-1), vec![0x81]);
        assert_eq!(encode_script_number(1_700_000_000), vec![0x00, 0x45, 0x53, 0x65]);
    }

    #[test]
    fn test_push_data_widths() {
        let mut s = Vec::new();
        push_data(&mut s, &[0xAA; 5]);
        assert_eq!(s[0], 5);

        let mut s = Vec::new();
        push_data(&mut s, &[0xAA; 100]);
        assert_eq!(s[0], OP_PUSHDATA1);
        assert_eq!(s[1], 100);

        let mut s = Vec::new();
        push_data(&mut s, &[0xAA; 300]);
        assert_eq!(s[0], OP_PUSHDATA2);
        assert_eq!(&s[1..3], &300u16.to_le_bytes());
    }

    #[test]
    fn test_multisig_shape() {
        let (_, client) = keypair();
        let (_, server) = keypair();
        let script = multisig_2of2(&client, &server);

        assert_eq!(script.len(), 71);
        assert_eq!(script[0], OP_2);
        assert_eq!(script[1], 33);
        assert_eq!(&script[2..35], &client.serialize());
        assert_eq!(script[35], 33);
        assert_eq!(&script[36..69], &server.serialize());
        assert_eq!(script[69], OP_2);
        assert_eq!(script[70], OP_CHECKMULTISIG);
    }

    #[test]
    fn test_cltv_redeem_and_p2sh() {
        let (_, client) = keypair();
        let (_, server) = keypair();
        let expiry = 1_700_000_000u64;
        let redeem = cltv_redeem_script(&client, &server, expiry);

        assert_eq!(redeem[0], OP_IF);
        assert_eq!(*redeem.last().unwrap(), OP_ENDIF);
        // The multisig branch is embedded verbatim.
        let multisig = multisig_2of2(&client, &server);
        assert_eq!(&redeem[1..1 + multisig.len()], &multisig[..]);

        let wrapper = p2sh_script(&redeem);
        assert_eq!(wrapper.len(), 23);
        assert_eq!(wrapper[0], OP_HASH160);
        assert_eq!(&wrapper[2..22], &hash160(&redeem));
        assert_eq!(wrapper[22], OP_EQUAL);
    }

    #[test]
    fn test_p2pkh_shape() {
        let (_, pk) = keypair();
        let script = p2pkh_script(&pk);
        assert_eq!(script.len(), 25);
        assert_eq!(script[0], OP_DUP);
        assert_eq!(script[24], OP_CHECKSIG);
    }

    #[test]
    fn test_sign_verify_round_trip() {
        let (sk, pk) = keypair();
        let digest = crate::merkle::double_sha256(b"channel digest");

        let sig = sign_digest(&sk, &digest);
        assert_eq!(*sig.last().unwrap(), SIGHASH_ALL as u8);
        verify_digest(&pk, &digest, &sig).unwrap();

        // Wrong key
        let (_, other) = keypair();
        assert_eq!(
            verify_digest(&other, &digest, &sig),
            Err(VerificationError::BadSignature)
        );

        // Wrong digest
        let other_digest = crate::merkle::double_sha256(b"something else");
        assert!(verify_digest(&pk, &other_digest, &sig).is_err());

        // Garbage bytes
        assert!(verify_digest(&pk, &digest, &[0x01, 0x02]).is_err());
    }
}
