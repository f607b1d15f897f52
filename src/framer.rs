// =============================================================================
// SATLINK v1.2 - Packet Framer
// =============================================================================
//
// Locates message boundaries in a byte stream that may deliver partial
// reads. Push-based: the connection owner feeds whatever the socket
// produced and gets back zero or more complete packets.
//
//   SEEK_MAGIC -> READ_HEADER -> READ_PAYLOAD -> (dispatch) -> SEEK_MAGIC
//
// A payload longer than the bytes at hand accumulates into a buffer sized
// to the declared length; the declared length is checked against MAX_SIZE
// before that buffer is allocated, so a peer advertising 40 MiB costs us
// nothing. Magic mismatch, a garbage command field and checksum mismatch
// are fatal for the connection: retrying the same bytes cannot succeed.
//
// =============================================================================

use sha2::{Digest, Sha256};

use crate::error::ProtocolError;
use crate::{COMMAND_SIZE, HEADER_SIZE, MAX_SIZE};

/// One complete framed packet, checksum already verified.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WirePacket {
    pub command: String,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
enum FramerState {
    SeekMagic,
    ReadHeader,
    ReadPayload {
        command: String,
        checksum: [u8; 4],
        /// Accumulation buffer, pre-sized to the declared payload length.
        accum: Vec<u8>,
        length: usize,
    },
}

/// Per-connection framing state machine. Not internally synchronized: it
/// is owned by whatever task owns the connection's read events and fed
/// sequentially, so payloads reach the caller in receive order.
pub struct PacketFramer {
    magic: [u8; 4],
    state: FramerState,
    buf: Vec<u8>,
}

impl PacketFramer {
    pub fn new(magic: [u8; 4]) -> Self {
        PacketFramer { magic, state: FramerState::SeekMagic, buf: Vec::new() }
    }

    /// Feeds newly received bytes in, returns every packet completed by
    /// them. Any error is fatal for this connection; the framer must be
    /// discarded afterwards.
    pub fn receive(&mut self, data: &[u8]) -> Result<Vec<WirePacket>, ProtocolError> {
        self.buf.extend_from_slice(data);
        let mut packets = Vec::new();

        loop {
            match &mut self.state {
                FramerState::SeekMagic => {
                    if self.buf.len() < 4 {
                        break;
                    }
                    if self.buf[..4] != self.magic {
                        let mut found = [0u8; 4];
                        found.copy_from_slice(&self.buf[..4]);
                        return Err(ProtocolError::BadMagic { found });
                    }
                    self.state = FramerState::ReadHeader;
                }

                FramerState::ReadHeader => {
                    if self.buf.len() < HEADER_SIZE {
                        break;
                    }
                    let command = parse_command(&self.buf[4..4 + COMMAND_SIZE])?;
                    let length = u32::from_le_bytes(
                        self.buf[16..20].try_into().expect("4 bytes"),
                    ) as usize;
                    // Reject before allocating the accumulation buffer.
                    if length > MAX_SIZE {
                        return Err(ProtocolError::Oversized { declared: length, max: MAX_SIZE });
                    }
                    let mut checksum = [0u8; 4];
                    checksum.copy_from_slice(&self.buf[20..24]);

                    self.buf.drain(..HEADER_SIZE);
                    self.state = FramerState::ReadPayload {
                        command,
                        checksum,
                        accum: Vec::with_capacity(length),
                        length,
                    };
                }

                FramerState::ReadPayload { command, checksum, accum, length } => {
                    let missing = *length - accum.len();
                    let take = missing.min(self.buf.len());
                    accum.extend(self.buf.drain(..take));

                    if accum.len() < *length {
                        break; // wait for the next read event
                    }

                    if payload_checksum(accum) != *checksum {
                        return Err(ProtocolError::BadChecksum);
                    }
                    packets.push(WirePacket {
                        command: std::mem::take(command),
                        payload: std::mem::take(accum),
                    });
                    self.state = FramerState::SeekMagic;
                }
            }
        }

        Ok(packets)
    }
}

/// First four bytes of double-SHA256 over the payload.
fn payload_checksum(payload: &[u8]) -> [u8; 4] {
    let digest = Sha256::digest(Sha256::digest(payload));
    let mut checksum = [0u8; 4];
    checksum.copy_from_slice(&digest[..4]);
    checksum
}

/// Command field: ASCII, null-padded to 12 bytes, nothing after the
/// first NUL.
fn parse_command(field: &[u8]) -> Result<String, ProtocolError> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(COMMAND_SIZE);
    if field[end..].iter().any(|&b| b != 0) {
        return Err(ProtocolError::BadCommand);
    }
    let name = &field[..end];
    if name.is_empty() || !name.iter().all(|&b| (0x20..0x7F).contains(&b)) {
        return Err(ProtocolError::BadCommand);
    }
    Ok(String::from_utf8(name.to_vec()).expect("checked ascii"))
}

/// Frames a payload for the wire: header + payload bytes.
pub fn frame_packet(
    magic: [u8; 4],
    command: &str,
    payload: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    if command.is_empty() || command.len() > COMMAND_SIZE || !command.is_ascii() {
        return Err(ProtocolError::BadCommand);
    }
    if payload.len() > MAX_SIZE {
        return Err(ProtocolError::Oversized { declared: payload.len(), max: MAX_SIZE });
    }

    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&magic);
    let mut cmd = [0u8; COMMAND_SIZE];
    cmd[..command.len()].copy_from_slice(command.as_bytes());
    out.extend_from_slice(&cmd);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload_checksum(payload));
    out.extend_from_slice(payload);
    Ok(out)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MAINNET_MAGIC;

    #[test]
    fn test_round_trip_single_packet() {
        let bytes = frame_packet(MAINNET_MAGIC, "ping", &42u64.to_le_bytes()).unwrap();
        let mut framer = PacketFramer::new(MAINNET_MAGIC);
        let packets = framer.receive(&bytes).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].command, "ping");
        assert_eq!(packets[0].payload, 42u64.to_le_bytes());
    }

    #[test]
    fn test_byte_at_a_time_delivery() {
        let bytes = frame_packet(MAINNET_MAGIC, "verack", &[]).unwrap();
        let mut framer = PacketFramer::new(MAINNET_MAGIC);

        let mut all = Vec::new();
        for b in &bytes {
            all.extend(framer.receive(std::slice::from_ref(b)).unwrap());
        }
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].command, "verack");
    }

    #[test]
    fn test_payload_spanning_reads() {
        let payload = vec![0xA5u8; 100_000];
        let bytes = frame_packet(MAINNET_MAGIC, "block", &payload).unwrap();
        let mut framer = PacketFramer::new(MAINNET_MAGIC);

        let mid = bytes.len() / 2;
        assert!(framer.receive(&bytes[..mid]).unwrap().is_empty());
        let packets = framer.receive(&bytes[mid..]).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].payload, payload);
    }

    #[test]
    fn test_two_packets_in_one_read() {
        let mut bytes = frame_packet(MAINNET_MAGIC, "ping", &1u64.to_le_bytes()).unwrap();
        bytes.extend(frame_packet(MAINNET_MAGIC, "pong", &1u64.to_le_bytes()).unwrap());

        let mut framer = PacketFramer::new(MAINNET_MAGIC);
        let packets = framer.receive(&bytes).unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].command, "ping");
        assert_eq!(packets[1].command, "pong");
    }

    #[test]
    fn test_oversized_length_rejected_before_buffering() {
        // Header advertising a 40 MiB payload and nothing else.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAINNET_MAGIC);
        let mut cmd = [0u8; COMMAND_SIZE];
        cmd[..5].copy_from_slice(b"block");
        bytes.extend_from_slice(&cmd);
        bytes.extend_from_slice(&(40u32 * 1024 * 1024).to_le_bytes());
        bytes.extend_from_slice(&[0u8; 4]);

        let mut framer = PacketFramer::new(MAINNET_MAGIC);
        assert!(matches!(
            framer.receive(&bytes),
            Err(ProtocolError::Oversized { .. })
        ));
    }

    #[test]
    fn test_bad_magic_fatal() {
        let mut framer = PacketFramer::new(MAINNET_MAGIC);
        assert!(matches!(
            framer.receive(&[0xDE, 0xAD, 0xBE, 0xEF]),
            Err(ProtocolError::BadMagic { .. })
        ));
    }

    #[test]
    fn test_bad_checksum_fatal() {
        let mut bytes = frame_packet(MAINNET_MAGIC, "ping", &7u64.to_le_bytes()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF; // corrupt the payload

        let mut framer = PacketFramer::new(MAINNET_MAGIC);
        assert_eq!(framer.receive(&bytes), Err(ProtocolError::BadChecksum));
    }

    #[test]
    fn test_command_padding_enforced() {
        let mut bytes = frame_packet(MAINNET_MAGIC, "ping", &[]).unwrap();
        // A byte after the terminating NUL in the command field.
        bytes[4 + 6] = b'x';
        let mut framer = PacketFramer::new(MAINNET_MAGIC);
        assert!(framer.receive(&bytes).is_err());
    }

    #[test]
    fn test_frame_rejects_long_command() {
        assert!(frame_packet(MAINNET_MAGIC, "averylongcommand", &[]).is_err());
    }
}
