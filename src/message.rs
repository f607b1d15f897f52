// =============================================================================
// SATLINK v1.2 - Wire Messages
// =============================================================================
//
// Typed wire structures and the dispatch from (command, payload bytes) to a
// parsed value. One tagged sum type (`Payload`) covers every message kind;
// parsing and serialization are free functions of the current fields, so a
// value that was parsed and never modified serializes back byte-identical.
// There is no cached serialization buffer to invalidate: "modifying" a
// message means building a new value.
//
// Cursor/offset/length bookkeeping lives in `codec::ByteCursor`; a parse
// consumes exactly the bytes belonging to the message and anything left
// over is a protocol error.
//
// =============================================================================

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::codec::{
    write_u16_be, write_u32_le, write_u64_le, write_var_string, write_varint, ByteCursor,
};
use crate::error::ProtocolError;
use crate::merkle::{Hash256, PartialMerkleTree};
use crate::{MAX_SIZE, PROTOCOL_VERSION};

/// Upper bound on entries in a single `addr` message.
const MAX_ADDRESSES: u64 = 1000;

// =============================================================================
// PeerAddress
// =============================================================================

/// A peer's advertised network endpoint. IPv4 addresses travel v4-mapped
/// into IPv6 form; the port is big-endian, unlike every other integer on
/// the wire. Onion-style peers carry a hostname instead of a routable IP
/// and are not representable in this encoding (they serialize as the
/// unspecified address).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerAddress {
    pub services: u64,
    pub addr: IpAddr,
    pub port: u16,
    /// Advertisement time; present in `addr` payloads, absent inside
    /// `version`.
    pub timestamp: Option<u32>,
    pub hostname: Option<String>,
}

impl PeerAddress {
    pub fn new(addr: IpAddr, port: u16, services: u64) -> Self {
        PeerAddress { services, addr, port, timestamp: None, hostname: None }
    }

    pub fn from_socket_addr(sock: SocketAddr, services: u64) -> Self {
        PeerAddress::new(sock.ip(), sock.port(), services)
    }

    pub fn for_hostname(hostname: &str, port: u16, services: u64) -> Self {
        PeerAddress {
            services,
            addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port,
            timestamp: None,
            hostname: Some(hostname.to_string()),
        }
    }

    pub fn read(cursor: &mut ByteCursor, with_timestamp: bool) -> Result<Self, ProtocolError> {
        let timestamp = if with_timestamp { Some(cursor.read_u32_le()?) } else { None };
        let services = cursor.read_u64_le()?;

        let mut octets = [0u8; 16];
        octets.copy_from_slice(&cursor.read_bytes(16)?);
        let v6 = Ipv6Addr::from(octets);
        let addr = match v4_mapped(&octets) {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        };

        let port = cursor.read_u16_be()?;

        Ok(PeerAddress { services, addr, port, timestamp, hostname: None })
    }

    pub fn write(&self, out: &mut Vec<u8>, with_timestamp: bool) {
        if with_timestamp {
            write_u32_le(out, self.timestamp.unwrap_or(0));
        }
        write_u64_le(out, self.services);
        let octets = match self.addr {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        };
        out.extend_from_slice(&octets);
        write_u16_be(out, self.port);
    }
}

fn v4_mapped(octets: &[u8; 16]) -> Option<Ipv4Addr> {
    if octets[..10].iter().all(|&b| b == 0) && octets[10] == 0xFF && octets[11] == 0xFF {
        Some(Ipv4Addr::new(octets[12], octets[13], octets[14], octets[15]))
    } else {
        None
    }
}

// =============================================================================
// VersionMessage
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: u32,
    pub services: u64,
    pub timestamp: u64,
    pub addr_recv: PeerAddress,
    pub addr_from: PeerAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: u32,
    pub relay: bool,
}

impl VersionMessage {
    /// Outbound announcement for a handshake. The random nonce lets a
    /// node recognize a connection to itself.
    pub fn announce(addr_recv: PeerAddress, addr_from: PeerAddress, start_height: u32) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        VersionMessage {
            version: PROTOCOL_VERSION,
            services: 0,
            timestamp,
            addr_recv,
            addr_from,
            nonce: rand::random(),
            user_agent: format!("/satlink:{}/", env!("CARGO_PKG_VERSION")),
            start_height,
            relay: true,
        }
    }

    pub fn read(cursor: &mut ByteCursor) -> Result<Self, ProtocolError> {
        let version = cursor.read_u32_le()?;
        let services = cursor.read_u64_le()?;
        let timestamp = cursor.read_u64_le()?;
        let addr_recv = PeerAddress::read(cursor, false)?;
        let addr_from = PeerAddress::read(cursor, false)?;
        let nonce = cursor.read_u64_le()?;
        let user_agent = cursor.read_var_string()?;
        let start_height = cursor.read_u32_le()?;
        // Relay flag exists from BIP37 on; absent means relay.
        let relay = if cursor.remaining() > 0 { cursor.read_u8()? != 0 } else { true };

        Ok(VersionMessage {
            version,
            services,
            timestamp,
            addr_recv,
            addr_from,
            nonce,
            user_agent,
            start_height,
            relay,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        write_u32_le(out, self.version);
        write_u64_le(out, self.services);
        write_u64_le(out, self.timestamp);
        self.addr_recv.write(out, false);
        self.addr_from.write(out, false);
        write_u64_le(out, self.nonce);
        write_var_string(out, &self.user_agent);
        write_u32_le(out, self.start_height);
        out.push(self.relay as u8);
    }
}

// =============================================================================
// BlockHeader
// =============================================================================

/// The fixed 80-byte block header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn read(cursor: &mut ByteCursor) -> Result<Self, ProtocolError> {
        Ok(BlockHeader {
            version: cursor.read_u32_le()?,
            prev_hash: cursor.read_hash()?,
            merkle_root: cursor.read_hash()?,
            time: cursor.read_u32_le()?,
            bits: cursor.read_u32_le()?,
            nonce: cursor.read_u32_le()?,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        write_u32_le(out, self.version);
        out.extend_from_slice(&self.prev_hash);
        out.extend_from_slice(&self.merkle_root);
        write_u32_le(out, self.time);
        write_u32_le(out, self.bits);
        write_u32_le(out, self.nonce);
    }
}

// =============================================================================
// MerkleBlock
// =============================================================================

/// A block header plus a partial merkle tree proving a transaction subset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MerkleBlockMessage {
    pub header: BlockHeader,
    pub tree: PartialMerkleTree,
}

impl MerkleBlockMessage {
    pub fn read(cursor: &mut ByteCursor) -> Result<Self, ProtocolError> {
        let header = BlockHeader::read(cursor)?;
        let tree = PartialMerkleTree::read(cursor)?;
        Ok(MerkleBlockMessage { header, tree })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        self.header.write(out);
        self.tree.write(out);
    }
}

// =============================================================================
// Payload dispatch
// =============================================================================

/// Every message kind this node understands, plus a passthrough for the
/// ones it does not.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    Version(VersionMessage),
    Verack,
    Ping(u64),
    Pong(u64),
    Addr(Vec<PeerAddress>),
    MerkleBlock(MerkleBlockMessage),
    Unknown { command: String, bytes: Vec<u8> },
}

impl Payload {
    /// Parses a complete payload for `command`. The whole payload must be
    /// consumed; trailing bytes are a protocol error.
    pub fn parse(command: &str, bytes: &[u8]) -> Result<Payload, ProtocolError> {
        if bytes.len() > MAX_SIZE {
            return Err(ProtocolError::Oversized { declared: bytes.len(), max: MAX_SIZE });
        }

        let mut cursor = ByteCursor::new(bytes, 0);
        let payload = match command {
            "version" => Payload::Version(VersionMessage::read(&mut cursor)?),
            "verack" => Payload::Verack,
            "ping" => Payload::Ping(cursor.read_u64_le()?),
            "pong" => Payload::Pong(cursor.read_u64_le()?),
            "addr" => {
                let count = cursor.read_varint()?;
                if count > MAX_ADDRESSES {
                    return Err(ProtocolError::Malformed(format!(
                        "addr message with {} entries",
                        count
                    )));
                }
                let mut addrs = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    addrs.push(PeerAddress::read(&mut cursor, true)?);
                }
                Payload::Addr(addrs)
            }
            "merkleblock" => Payload::MerkleBlock(MerkleBlockMessage::read(&mut cursor)?),
            _ => {
                return Ok(Payload::Unknown {
                    command: command.to_string(),
                    bytes: bytes.to_vec(),
                })
            }
        };

        if cursor.remaining() != 0 {
            return Err(ProtocolError::Malformed(format!(
                "{} trailing bytes after {} message",
                cursor.remaining(),
                command
            )));
        }
        Ok(payload)
    }

    /// Pure serialization from current fields.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Payload::Version(v) => v.write(&mut out),
            Payload::Verack => {}
            Payload::Ping(nonce) | Payload::Pong(nonce) => write_u64_le(&mut out, *nonce),
            Payload::Addr(addrs) => {
                write_varint(&mut out, addrs.len() as u64);
                for addr in addrs {
                    addr.write(&mut out, true);
                }
            }
            Payload::MerkleBlock(mb) => mb.write(&mut out),
            Payload::Unknown { bytes, .. } => out.extend_from_slice(bytes),
        }
        out
    }

    pub fn command(&self) -> &str {
        match self {
            Payload::Version(_) => "version",
            Payload::Verack => "verack",
            Payload::Ping(_) => "ping",
            Payload::Pong(_) => "pong",
            Payload::Addr(_) => "addr",
            Payload::MerkleBlock(_) => "merkleblock",
            Payload::Unknown { command, .. } => command,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merkle::{double_sha256, merkle_root};

    fn sample_version() -> VersionMessage {
        VersionMessage {
            version: 70001,
            services: 1,
            timestamp: 1700000000,
            addr_recv: PeerAddress::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)), 8333, 1),
            addr_from: PeerAddress::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 8333, 1),
            nonce: 0x1234_5678_90AB_CDEF,
            user_agent: "/satlink:1.2.0/".to_string(),
            start_height: 820_000,
            relay: true,
        }
    }

    #[test]
    fn test_version_round_trip() {
        let msg = Payload::Version(sample_version());
        let bytes = msg.serialize();
        let parsed = Payload::parse("version", &bytes).unwrap();
        assert_eq!(parsed, msg);
        // Unmodified parse re-serializes byte-identical.
        assert_eq!(parsed.serialize(), bytes);
    }

    #[test]
    fn test_announce_round_trips() {
        let recv = PeerAddress::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 8333, 0);
        let from = PeerAddress::new(IpAddr::V4(Ipv4Addr::new(2, 2, 2, 2)), 8333, 0);
        let msg = VersionMessage::announce(recv, from, 820_000);
        assert_eq!(msg.version, PROTOCOL_VERSION);
        assert!(msg.user_agent.starts_with("/satlink:"));

        let payload = Payload::Version(msg);
        let bytes = payload.serialize();
        assert_eq!(Payload::parse("version", &bytes).unwrap(), payload);
    }

    #[test]
    fn test_peer_address_v4_mapping() {
        let addr = PeerAddress::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 8333, 5);
        let mut bytes = Vec::new();
        addr.write(&mut bytes, false);

        // services(8) + ip(16) + port(2)
        assert_eq!(bytes.len(), 26);
        // v4-mapped prefix then the four address bytes
        assert_eq!(&bytes[8..18], &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&bytes[18..20], &[0xFF, 0xFF]);
        assert_eq!(&bytes[20..24], &[1, 2, 3, 4]);
        // port is big-endian
        assert_eq!(&bytes[24..26], &8333u16.to_be_bytes());

        let mut cursor = ByteCursor::new(&bytes, 0);
        let parsed = PeerAddress::read(&mut cursor, false).unwrap();
        assert_eq!(parsed.addr, addr.addr);
        assert_eq!(parsed.port, 8333);
    }

    #[test]
    fn test_addr_round_trip_with_timestamps() {
        let mut a = PeerAddress::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 8333, 1);
        a.timestamp = Some(1700000123);
        let mut b = PeerAddress::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 18333, 9);
        b.timestamp = Some(1700000456);

        let msg = Payload::Addr(vec![a, b]);
        let bytes = msg.serialize();
        let parsed = Payload::parse("addr", &bytes).unwrap();
        assert_eq!(parsed, msg);
        assert_eq!(parsed.serialize(), bytes);
    }

    #[test]
    fn test_addr_count_bound() {
        let mut bytes = Vec::new();
        write_varint(&mut bytes, 100_000);
        assert!(Payload::parse("addr", &bytes).is_err());
    }

    #[test]
    fn test_ping_pong() {
        let bytes = Payload::Ping(42).serialize();
        assert_eq!(Payload::parse("ping", &bytes).unwrap(), Payload::Ping(42));
        assert_eq!(Payload::parse("pong", &bytes).unwrap(), Payload::Pong(42));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = Payload::Ping(7).serialize();
        bytes.push(0x00);
        assert!(matches!(
            Payload::parse("ping", &bytes),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_truncated_version_rejected() {
        let bytes = Payload::Version(sample_version()).serialize();
        let result = Payload::parse("version", &bytes[..20]);
        assert!(matches!(result, Err(ProtocolError::Truncated { .. })));
    }

    #[test]
    fn test_unknown_passthrough() {
        let parsed = Payload::parse("wtfmessage", &[1, 2, 3]).unwrap();
        assert_eq!(
            parsed,
            Payload::Unknown { command: "wtfmessage".to_string(), bytes: vec![1, 2, 3] }
        );
        assert_eq!(parsed.serialize(), vec![1, 2, 3]);
    }

    #[test]
    fn test_merkleblock_round_trip() {
        let leaves: Vec<_> = (0..7u64)
            .map(|i| double_sha256(&i.to_le_bytes()))
            .collect();
        let include: Vec<bool> = (0..7).map(|i| i == 3).collect();
        let tree = PartialMerkleTree::from_leaves(&include, &leaves);

        let msg = Payload::MerkleBlock(MerkleBlockMessage {
            header: BlockHeader {
                version: 4,
                prev_hash: [0x11; 32],
                merkle_root: merkle_root(&leaves),
                time: 1700000000,
                bits: 0x1D00FFFF,
                nonce: 99,
            },
            tree,
        });

        let bytes = msg.serialize();
        let parsed = Payload::parse("merkleblock", &bytes).unwrap();
        assert_eq!(parsed, msg);
        assert_eq!(parsed.serialize(), bytes);

        // The embedded proof verifies against the embedded header root.
        if let Payload::MerkleBlock(mb) = parsed {
            let matches = mb.tree.extract_and_verify(&mb.header.merkle_root).unwrap();
            assert_eq!(matches, vec![(3, leaves[3])]);
        }
    }
}
