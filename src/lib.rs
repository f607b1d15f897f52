// =============================================================================
// SATLINK v1.2 - Protocol Constants
// Bitcoin wire protocol + two-party micropayment channels
// =============================================================================

pub mod codec;
pub mod error;
pub mod framer;
pub mod merkle;
pub mod message;
pub mod script;
pub mod transaction;

pub mod channels;

// --- Network parameters ---
pub const MAINNET_MAGIC: [u8; 4] = [0xF9, 0xBE, 0xB4, 0xD9];
pub const TESTNET_MAGIC: [u8; 4] = [0x0B, 0x11, 0x09, 0x07];
pub const PROTOCOL_VERSION: u32 = 70001;
pub const DEFAULT_PORT: u16 = 8333;

/// Hard cap on any wire message payload. A peer advertising more than this
/// is trying to make us allocate, not talk to us.
pub const MAX_SIZE: usize = 32 * 1024 * 1024; // 32 MiB

/// Command field width in the packet header (ASCII, null-padded).
pub const COMMAND_SIZE: usize = 12;

/// Full packet header: magic(4) + command(12) + length(4) + checksum(4).
pub const HEADER_SIZE: usize = 24;

// --- Monetary parameters ---
pub const COIN: u64 = 100_000_000;
pub const MAX_MONEY: u64 = 21_000_000 * COIN;

/// Outputs below this are uneconomical to spend.
pub const DUST_LIMIT: u64 = 546;

// --- Utilities ---
pub fn format_coins(satoshis: u64) -> String {
    let whole = satoshis / COIN;
    let frac = satoshis % COIN;
    if frac == 0 {
        format!("{} BTC", whole)
    } else {
        format!("{}.{:08} BTC", whole, frac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_coins() {
        assert_eq!(format_coins(50 * COIN), "50 BTC");
        assert_eq!(format_coins(COIN / 2), "0.50000000 BTC");
    }

    #[test]
    fn test_max_money_fits() {
        assert!(MAX_MONEY < u64::MAX);
    }
}
