//! Streaming transfer CRCs
//!
//! Two algorithms are used by the protocol: CRC-16/CCITT-FALSE protects CAN multi-frame transfers
//! and the high-overhead frame header, and CRC-32C (Castagnoli) protects high-overhead transfer
//! payloads. Both support residue verification so a reassembler can keep digesting bytes
//! (including the trailing CRC itself) without knowing in advance where the payload ends.

use crc_any::{CRCu16, CRCu32};

/// CRC-16/CCITT-FALSE: poly 0x1021, init 0xFFFF, unreflected, no output XOR
///
/// The value is transmitted big-endian; digesting a correct codeword (payload followed by its CRC)
/// leaves a zero residue.
pub struct TransferCrc16 {
    inner: CRCu16,
}

impl TransferCrc16 {
    pub const RESIDUE: u16 = 0x0000;

    pub fn new() -> Self {
        Self {
            inner: CRCu16::crc16ccitt_false(),
        }
    }

    /// One-shot CRC of a byte string
    pub fn of(bytes: &[u8]) -> u16 {
        let mut crc = Self::new();
        crc.add(bytes);
        crc.value()
    }

    pub fn add(&mut self, bytes: &[u8]) {
        self.inner.digest(bytes);
    }

    pub fn value(&mut self) -> u16 {
        self.inner.get_crc()
    }

    /// Big-endian wire representation of the current value
    pub fn value_as_bytes(&mut self) -> [u8; 2] {
        self.value().to_be_bytes()
    }

    pub fn check_residue(&mut self) -> bool {
        self.value() == Self::RESIDUE
    }
}

impl Default for TransferCrc16 {
    fn default() -> Self {
        Self::new()
    }
}

/// CRC-32C (Castagnoli): poly 0x1EDC6F41, init 0xFFFFFFFF, reflected, output XOR 0xFFFFFFFF
///
/// The value is transmitted little-endian. The residue below is the post-XOR register value left
/// after digesting a correct codeword.
pub struct TransferCrc32 {
    inner: CRCu32,
}

impl TransferCrc32 {
    pub const RESIDUE: u32 = 0x4867_4BC7;

    pub fn new() -> Self {
        Self {
            inner: CRCu32::crc32c(),
        }
    }

    pub fn of(bytes: &[u8]) -> u32 {
        let mut crc = Self::new();
        crc.add(bytes);
        crc.value()
    }

    /// One-shot CRC over a fragmented payload
    pub fn of_fragments(fragments: &[Vec<u8>]) -> u32 {
        let mut crc = Self::new();
        for fragment in fragments {
            crc.add(fragment);
        }
        crc.value()
    }

    pub fn add(&mut self, bytes: &[u8]) {
        self.inner.digest(bytes);
    }

    pub fn value(&mut self) -> u32 {
        self.inner.get_crc()
    }

    /// Little-endian wire representation of the current value
    pub fn value_as_bytes(&mut self) -> [u8; 4] {
        self.value().to_le_bytes()
    }

    pub fn check_residue(&mut self) -> bool {
        self.value() == Self::RESIDUE
    }
}

impl Default for TransferCrc32 {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of CRC bytes appended to a high-overhead transfer
pub const TRANSFER_CRC32_SIZE: usize = 4;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_check_value() {
        assert_eq!(TransferCrc16::of(b"123456789"), 0x29B1);
    }

    #[test]
    fn test_crc16_known_transfer_value() {
        // CRC of the byte sequence 0x00..0x1D, used by the CAN multi-frame format
        let payload: Vec<u8> = (0..0x1E).collect();
        assert_eq!(TransferCrc16::of(&payload), 0x3554);
    }

    #[test]
    fn test_crc16_residue() {
        let mut crc = TransferCrc16::new();
        crc.add(b"123456789");
        let trailer = crc.value_as_bytes();
        crc.add(&trailer);
        assert!(crc.check_residue());
    }

    #[test]
    fn test_crc32c_check_value() {
        assert_eq!(TransferCrc32::of(b"123456789"), 0xE306_9283);
    }

    #[test]
    fn test_crc32c_residue() {
        let mut crc = TransferCrc32::new();
        crc.add(b"hello world");
        let trailer = crc.value_as_bytes();
        crc.add(&trailer);
        assert!(crc.check_residue());

        let mut bad = TransferCrc32::new();
        bad.add(b"hello world");
        bad.add(&[0, 0, 0, 0]);
        assert!(!bad.check_residue());
    }

    #[test]
    fn test_crc32c_streaming_matches_one_shot() {
        let mut streaming = TransferCrc32::new();
        streaming.add(b"hello ");
        streaming.add(b"world");
        assert_eq!(streaming.value(), TransferCrc32::of(b"hello world"));
    }
}
