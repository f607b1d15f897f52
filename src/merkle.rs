// =============================================================================
// SATLINK v1.2 - Partial Merkle Trees
// =============================================================================
//
// Compact SPV inclusion proofs: prove that a subset of transactions is in a
// block without shipping the full block. The structure is a depth-first
// pruned traversal of the block's merkle tree:
//
// - one flag bit per visited node: 1 = ancestor of a matched leaf
//   (or a matched leaf itself), 0 = prune here
// - a hash is stored for every pruned node and for every leaf reached,
//   so the verifier can rebuild the root from bits + hashes alone
//
// Wire form:
//   uint32 total_transactions (LE)
//   varint hash count, then 32-byte hashes
//   varint flag-byte count, then flag bits packed LSB-first
//
// Encoded size is bounded by 10 + ceil(32.25 * N) bytes for N leaves.
//
// =============================================================================

use sha2::{Digest, Sha256};

use crate::codec::{write_u32_le, write_varint, ByteCursor};
use crate::error::{ProtocolError, VerificationError};
use crate::MAX_SIZE;

// =============================================================================
// Hash primitives
// =============================================================================

pub const HASH_SIZE: usize = 32;

pub type Hash256 = [u8; HASH_SIZE];

pub fn sha256(data: &[u8]) -> Hash256 {
    let mut hash = [0u8; HASH_SIZE];
    hash.copy_from_slice(&Sha256::digest(data));
    hash
}

/// Double SHA256 (Bitcoin-style).
pub fn double_sha256(data: &[u8]) -> Hash256 {
    sha256(&sha256(data))
}

/// Hash two child nodes into their parent.
pub fn hash_pair(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut combined = Vec::with_capacity(64);
    combined.extend_from_slice(left);
    combined.extend_from_slice(right);
    double_sha256(&combined)
}

/// Standard pairwise merkle root with duplication of the last node at odd
/// levels. Reference algorithm for verifying partial trees.
pub fn merkle_root(leaves: &[Hash256]) -> Hash256 {
    if leaves.is_empty() {
        return [0u8; HASH_SIZE];
    }
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            let left = pair[0];
            let right = if pair.len() > 1 { pair[1] } else { pair[0] };
            next.push(hash_pair(&left, &right));
        }
        level = next;
    }
    level[0]
}

// =============================================================================
// PartialMerkleTree
// =============================================================================

/// A pruned merkle tree over `tx_count` leaves. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartialMerkleTree {
    tx_count: u32,
    hashes: Vec<Hash256>,
    bits: Vec<bool>,
}

/// A leaf recovered from a proof: (position in the block, txid).
pub type MatchedLeaf = (u32, Hash256);

impl PartialMerkleTree {
    /// Builds a proof for the leaves whose `include` flag is set.
    /// `include` and `leaves` must have the same length.
    pub fn from_leaves(include: &[bool], leaves: &[Hash256]) -> Self {
        assert_eq!(include.len(), leaves.len(), "one flag per leaf");

        let tx_count = leaves.len() as u32;
        let mut tree = PartialMerkleTree {
            tx_count,
            hashes: Vec::new(),
            bits: Vec::new(),
        };

        if tx_count > 0 {
            let height = tree.tree_height();
            tree.build_recursive(height, 0, include, leaves);
        }
        tree
    }

    pub fn tx_count(&self) -> u32 {
        self.tx_count
    }

    pub fn hashes(&self) -> &[Hash256] {
        &self.hashes
    }

    /// Width of the conceptual tree at `height` (0 = leaves).
    fn tree_width(&self, height: u32) -> u32 {
        (self.tx_count + (1 << height) - 1) >> height
    }

    /// Smallest height at which the tree narrows to a single node.
    fn tree_height(&self) -> u32 {
        let mut height = 0;
        while self.tree_width(height) > 1 {
            height += 1;
        }
        height
    }

    fn build_recursive(
        &mut self,
        height: u32,
        pos: u32,
        include: &[bool],
        leaves: &[Hash256],
    ) {
        // Does any leaf under this node carry the inclusion flag?
        let first = (pos << height) as usize;
        let last = (((pos + 1) << height) as usize).min(leaves.len());
        let parent_of_match = include[first..last].iter().any(|&m| m);

        self.bits.push(parent_of_match);

        if height == 0 || !parent_of_match {
            // Pruned subtree or leaf: store the hash and stop. A matched
            // leaf stores its hash too -- it is the thing being proven.
            self.hashes.push(self.calc_hash(height, pos, leaves));
        } else {
            self.build_recursive(height - 1, pos * 2, include, leaves);
            if pos * 2 + 1 < self.tree_width(height - 1) {
                self.build_recursive(height - 1, pos * 2 + 1, include, leaves);
            }
        }
    }

    fn calc_hash(&self, height: u32, pos: u32, leaves: &[Hash256]) -> Hash256 {
        if height == 0 {
            return leaves[pos as usize];
        }
        let left = self.calc_hash(height - 1, pos * 2, leaves);
        let right = if pos * 2 + 1 < self.tree_width(height - 1) {
            self.calc_hash(height - 1, pos * 2 + 1, leaves)
        } else {
            // Odd-width level: rightmost node pairs with itself.
            left
        };
        hash_pair(&left, &right)
    }

    // =========================================================================
    // Extraction
    // =========================================================================

    /// Re-runs the traversal, rebuilding the merkle root and recovering the
    /// matched leaves with their positions. Rejects malformed proofs,
    /// including tx counts inconsistent with the hashes/bits actually
    /// present (resource-exhaustion guard against malicious peers).
    pub fn extract_matches(&self) -> Result<(Hash256, Vec<MatchedLeaf>), VerificationError> {
        if self.tx_count == 0 {
            return Err(VerificationError::InconsistentProof(
                "zero transactions".to_string(),
            ));
        }
        // More leaves than could fit in a maximum-size message of 60-byte
        // transactions is a fabricated count.
        if self.tx_count as usize > MAX_SIZE / 60 {
            return Err(VerificationError::InconsistentProof(
                "transaction count exceeds plausible maximum".to_string(),
            ));
        }
        if self.hashes.len() > self.tx_count as usize {
            return Err(VerificationError::InconsistentProof(
                "more hashes than transactions".to_string(),
            ));
        }
        if self.bits.len() < self.hashes.len() {
            return Err(VerificationError::InconsistentProof(
                "fewer flag bits than hashes".to_string(),
            ));
        }

        let mut bits_used = 0usize;
        let mut hashes_used = 0usize;
        let mut matches = Vec::new();

        let root = self.extract_recursive(
            self.tree_height(),
            0,
            &mut bits_used,
            &mut hashes_used,
            &mut matches,
        )?;

        // Everything provided must have been consumed: leftover hashes or
        // set padding bits mean the proof was padded with extra data.
        if hashes_used != self.hashes.len() {
            return Err(VerificationError::InconsistentProof(
                "unconsumed hashes".to_string(),
            ));
        }
        if self.bits.len() - bits_used >= 8 {
            return Err(VerificationError::InconsistentProof(
                "unconsumed flag bits".to_string(),
            ));
        }
        if self.bits[bits_used..].iter().any(|&b| b) {
            return Err(VerificationError::InconsistentProof(
                "non-zero padding bits".to_string(),
            ));
        }

        Ok((root, matches))
    }

    /// Like `extract_matches`, but also checks the rebuilt root against an
    /// externally supplied expected root. No matched-leaf set is produced
    /// on mismatch.
    pub fn extract_and_verify(
        &self,
        expected_root: &Hash256,
    ) -> Result<Vec<MatchedLeaf>, VerificationError> {
        let (root, matches) = self.extract_matches()?;
        if &root != expected_root {
            return Err(VerificationError::MerkleRootMismatch);
        }
        Ok(matches)
    }

    fn extract_recursive(
        &self,
        height: u32,
        pos: u32,
        bits_used: &mut usize,
        hashes_used: &mut usize,
        matches: &mut Vec<MatchedLeaf>,
    ) -> Result<Hash256, VerificationError> {
        if *bits_used >= self.bits.len() {
            return Err(VerificationError::BitsExhausted);
        }
        let parent_of_match = self.bits[*bits_used];
        *bits_used += 1;

        if height == 0 || !parent_of_match {
            if *hashes_used >= self.hashes.len() {
                return Err(VerificationError::HashesExhausted);
            }
            let hash = self.hashes[*hashes_used];
            *hashes_used += 1;

            if height == 0 && parent_of_match {
                matches.push((pos, hash));
            }
            return Ok(hash);
        }

        let left = self.extract_recursive(height - 1, pos * 2, bits_used, hashes_used, matches)?;
        let right = if pos * 2 + 1 < self.tree_width(height - 1) {
            let right =
                self.extract_recursive(height - 1, pos * 2 + 1, bits_used, hashes_used, matches)?;
            // Identical left/right subtrees allow forging a second valid
            // encoding of the same root (CVE-2012-2459 class).
            if right == left {
                return Err(VerificationError::InconsistentProof(
                    "duplicate subtree hashes".to_string(),
                ));
            }
            right
        } else {
            left
        };

        Ok(hash_pair(&left, &right))
    }

    // =========================================================================
    // Wire codec
    // =========================================================================

    pub fn write(&self, out: &mut Vec<u8>) {
        write_u32_le(out, self.tx_count);
        write_varint(out, self.hashes.len() as u64);
        for hash in &self.hashes {
            out.extend_from_slice(hash);
        }
        let flag_bytes = pack_bits(&self.bits);
        write_varint(out, flag_bytes.len() as u64);
        out.extend_from_slice(&flag_bytes);
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write(&mut out);
        out
    }

    pub fn read(cursor: &mut ByteCursor) -> Result<Self, ProtocolError> {
        let tx_count = cursor.read_u32_le()?;
        if tx_count as usize > MAX_SIZE / 60 {
            return Err(ProtocolError::Oversized {
                declared: tx_count as usize,
                max: MAX_SIZE / 60,
            });
        }

        let hash_count = cursor.read_varint()? as usize;
        if hash_count > MAX_SIZE / HASH_SIZE {
            return Err(ProtocolError::Oversized {
                declared: hash_count,
                max: MAX_SIZE / HASH_SIZE,
            });
        }
        let mut hashes = Vec::with_capacity(hash_count);
        for _ in 0..hash_count {
            hashes.push(cursor.read_hash()?);
        }

        let flag_bytes = cursor.read_var_bytes()?;
        // A tree over N leaves has at most 2N-1 nodes, one flag bit each;
        // more flag bytes than that is padding we refuse to expand.
        let max_flag_bytes = (2 * tx_count as usize + 6) / 8;
        if flag_bytes.len() > max_flag_bytes {
            return Err(ProtocolError::Malformed(format!(
                "{} flag bytes for {} transactions",
                flag_bytes.len(),
                tx_count
            )));
        }
        let bits = unpack_bits(&flag_bytes);

        Ok(PartialMerkleTree { tx_count, hashes, bits })
    }
}

/// Packs bits LSB-first, 8 per byte, zero-padding the final byte.
fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; (bits.len() + 7) / 8];
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

fn unpack_bits(bytes: &[u8]) -> Vec<bool> {
    let mut bits = Vec::with_capacity(bytes.len() * 8);
    for byte in bytes {
        for i in 0..8 {
            bits.push((byte >> i) & 1 == 1);
        }
    }
    bits
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_hashes(n: usize) -> Vec<Hash256> {
        (0..n)
            .map(|i| {
                let mut seed = [0u8; 8];
                seed.copy_from_slice(&(i as u64).to_le_bytes());
                double_sha256(&seed)
            })
            .collect()
    }

    #[test]
    fn test_reference_root_odd_duplication() {
        let leaves = sample_hashes(3);
        let h01 = hash_pair(&leaves[0], &leaves[1]);
        let h22 = hash_pair(&leaves[2], &leaves[2]);
        assert_eq!(merkle_root(&leaves), hash_pair(&h01, &h22));
    }

    #[test]
    fn test_single_leaf_tree() {
        let leaves = sample_hashes(1);
        let pmt = PartialMerkleTree::from_leaves(&[true], &leaves);
        let (root, matches) = pmt.extract_matches().unwrap();
        assert_eq!(root, leaves[0]);
        assert_eq!(matches, vec![(0, leaves[0])]);
    }

    #[test]
    fn test_build_and_extract_many_shapes() {
        for n in 1..=24usize {
            let leaves = sample_hashes(n);
            let expected = merkle_root(&leaves);

            // One pattern with scattered matches, one with none, one full.
            let patterns: Vec<Vec<bool>> = vec![
                (0..n).map(|i| i % 3 == 1).collect(),
                vec![false; n],
                vec![true; n],
            ];

            for include in patterns {
                let pmt = PartialMerkleTree::from_leaves(&include, &leaves);
                let (root, matches) = pmt.extract_matches().unwrap();
                assert_eq!(root, expected, "root mismatch at n={}", n);

                let want: Vec<MatchedLeaf> = include
                    .iter()
                    .enumerate()
                    .filter(|(_, &m)| m)
                    .map(|(i, _)| (i as u32, leaves[i]))
                    .collect();
                assert_eq!(matches, want, "matches mismatch at n={}", n);
            }
        }
    }

    #[test]
    fn test_wire_round_trip() {
        let leaves = sample_hashes(9);
        let include: Vec<bool> = (0..9).map(|i| i == 2 || i == 8).collect();
        let pmt = PartialMerkleTree::from_leaves(&include, &leaves);

        let bytes = pmt.serialize();
        let mut cursor = ByteCursor::new(&bytes, 0);
        let decoded = PartialMerkleTree::read(&mut cursor).unwrap();
        assert_eq!(cursor.consumed(), bytes.len());

        // The decoded tree proves the same leaves against the same root.
        let (root, matches) = decoded.extract_matches().unwrap();
        assert_eq!(root, merkle_root(&leaves));
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0], (2, leaves[2]));
        assert_eq!(matches[1], (8, leaves[8]));
    }

    #[test]
    fn test_encoded_size_bound() {
        for n in 1..=64usize {
            let leaves = sample_hashes(n);
            let include: Vec<bool> = (0..n).map(|i| i % 2 == 0).collect();
            let pmt = PartialMerkleTree::from_leaves(&include, &leaves);
            let bound = 10 + (32.25 * n as f64).ceil() as usize;
            assert!(
                pmt.serialize().len() <= bound,
                "n={} size={} bound={}",
                n,
                pmt.serialize().len(),
                bound
            );
        }
    }

    #[test]
    fn test_root_mismatch_rejected() {
        let leaves = sample_hashes(6);
        let include = vec![false, true, false, false, false, false];
        let pmt = PartialMerkleTree::from_leaves(&include, &leaves);

        let mut wrong_root = merkle_root(&leaves);
        wrong_root[0] ^= 0xFF;
        assert_eq!(
            pmt.extract_and_verify(&wrong_root),
            Err(VerificationError::MerkleRootMismatch)
        );
    }

    #[test]
    fn test_zero_tx_count_rejected() {
        let pmt = PartialMerkleTree { tx_count: 0, hashes: vec![], bits: vec![] };
        assert!(pmt.extract_matches().is_err());
    }

    #[test]
    fn test_fabricated_tx_count_rejected() {
        // Claims four billion transactions but carries a single hash.
        let pmt = PartialMerkleTree {
            tx_count: u32::MAX,
            hashes: vec![[0xAB; 32]],
            bits: vec![true; 8],
        };
        assert!(matches!(
            pmt.extract_matches(),
            Err(VerificationError::InconsistentProof(_))
        ));
    }

    #[test]
    fn test_bit_exhaustion_rejected() {
        let leaves = sample_hashes(4);
        let include = vec![true, false, false, false];
        let mut pmt = PartialMerkleTree::from_leaves(&include, &leaves);
        // Claim an interior node has matched descendants, then starve the
        // traversal of the extra bits it now needs.
        pmt.bits.truncate(1);
        assert!(pmt.extract_matches().is_err());
    }

    #[test]
    fn test_extra_hashes_rejected() {
        let leaves = sample_hashes(4);
        let include = vec![true, false, false, false];
        let mut pmt = PartialMerkleTree::from_leaves(&include, &leaves);
        pmt.hashes.push([0x11; 32]);
        assert!(matches!(
            pmt.extract_matches(),
            Err(VerificationError::InconsistentProof(_))
        ));
    }

    #[test]
    fn test_huge_declared_hash_count_rejected() {
        // 4 transactions, then a varint claiming u64::MAX hashes. Must
        // come back as a protocol error, never an arithmetic panic.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&4u32.to_le_bytes());
        bytes.push(0xFF);
        bytes.extend_from_slice(&u64::MAX.to_le_bytes());

        let mut cursor = ByteCursor::new(&bytes, 0);
        assert!(matches!(
            PartialMerkleTree::read(&mut cursor),
            Err(ProtocolError::Oversized { .. })
        ));
    }

    #[test]
    fn test_huge_declared_tx_count_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.push(0); // no hashes
        bytes.push(0); // no flag bytes
        let mut cursor = ByteCursor::new(&bytes, 0);
        assert!(matches!(
            PartialMerkleTree::read(&mut cursor),
            Err(ProtocolError::Oversized { .. })
        ));
    }

    #[test]
    fn test_excess_flag_bytes_rejected() {
        // 2 transactions admit at most 3 flag bits (one byte); ten bytes
        // of flags is padding, rejected before unpacking.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.push(1);
        bytes.extend_from_slice(&[0xAB; 32]);
        bytes.push(10);
        bytes.extend_from_slice(&[0x00; 10]);

        let mut cursor = ByteCursor::new(&bytes, 0);
        assert!(matches!(
            PartialMerkleTree::read(&mut cursor),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_duplicate_subtree_rejected() {
        // Two identical sibling subtrees would let the same root admit two
        // distinct encodings.
        let h = double_sha256(b"dup");
        let pmt = PartialMerkleTree {
            tx_count: 2,
            hashes: vec![h, h],
            bits: vec![true, true, true],
        };
        assert!(matches!(
            pmt.extract_matches(),
            Err(VerificationError::InconsistentProof(_))
        ));
    }

    #[test]
    fn test_set_padding_bits_rejected() {
        let leaves = sample_hashes(4);
        let include = vec![true, false, false, false];
        let pmt = PartialMerkleTree::from_leaves(&include, &leaves);

        // Round-trip through the wire form, then set a padding bit.
        let mut bytes = pmt.serialize();
        let last = bytes.len() - 1;
        bytes[last] |= 0x80;
        let mut cursor = ByteCursor::new(&bytes, 0);
        let tampered = PartialMerkleTree::read(&mut cursor).unwrap();
        assert!(matches!(
            tampered.extract_matches(),
            Err(VerificationError::InconsistentProof(_))
        ));
    }
}
