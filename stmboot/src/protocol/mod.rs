//! STM32 UART ROM bootloader wire format.
//!
//! Every command is sent as the command byte followed by its complement, and
//! every multi-byte payload carries a trailing XOR checksum over the exact
//! bytes that precede it on the wire.
//!
//! ## Write Memory Sequence
//!
//! ```text
//! host                                   target
//!  | 0x31 0xCE                          -> |
//!  | <-                                0x79 |
//!  | A3 A2 A1 A0 (A3^A2^A1^A0)          -> |
//!  | <-                                0x79 |
//!  | N-1 D0 .. DN-1 ((N-1)^D0^..^DN-1)  -> |
//!  | <-                                0x79 |
//! ```

use byteorder::{BigEndian, ByteOrder};

/// Sync byte sent to enter the bootloader command loop.
pub const SYNC: u8 = 0x7F;

/// Positive acknowledgment.
pub const ACK: u8 = 0x79;

/// Negative acknowledgment.
pub const NACK: u8 = 0x1F;

/// Maximum payload of a single write-memory block.
pub const BLOCK_SIZE: usize = 256;

/// Extended erase payload selecting a global mass erase.
///
/// Special code `0xFFFF` followed by its checksum (`0xFF ^ 0xFF`).
pub const ERASE_ALL: [u8; 3] = [0xFF, 0xFF, 0x00];

/// Bootloader commands used by the flasher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Write memory.
    WriteMemory = 0x31,
    /// Extended erase.
    ExtendedErase = 0x44,
}

impl Command {
    /// Command byte followed by its complement.
    pub fn frame(self) -> [u8; 2] {
        let cmd = self as u8;
        [cmd, !cmd]
    }
}

/// XOR of all bytes.
pub fn xor_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Build the 5-byte address frame: big-endian address plus checksum.
pub fn address_frame(address: u32) -> [u8; 5] {
    let mut frame = [0u8; 5];
    BigEndian::write_u32(&mut frame[..4], address);
    frame[4] = xor_checksum(&frame[..4]);
    frame
}

/// Build a data frame: `len - 1`, the data, then the XOR of both.
///
/// `data` must hold between 1 and [`BLOCK_SIZE`] bytes.
pub fn data_frame(data: &[u8]) -> Vec<u8> {
    debug_assert!(!data.is_empty() && data.len() <= BLOCK_SIZE);
    #[allow(clippy::cast_possible_truncation)] // len <= 256
    let len_byte = (data.len() - 1) as u8;

    let mut frame = Vec::with_capacity(data.len() + 2);
    frame.push(len_byte);
    frame.extend_from_slice(data);
    frame.push(len_byte ^ xor_checksum(data));
    frame
}

/// Human readable name for a single reply byte.
pub fn describe_reply(byte: u8) -> &'static str {
    match byte {
        ACK => "ACK",
        NACK => "NACK",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_frame_is_complement() {
        assert_eq!(Command::WriteMemory.frame(), [0x31, 0xCE]);
        assert_eq!(Command::ExtendedErase.frame(), [0x44, 0xBB]);
    }

    #[test]
    fn test_xor_checksum() {
        assert_eq!(xor_checksum(&[]), 0);
        assert_eq!(xor_checksum(&[0xA5]), 0xA5);
        assert_eq!(xor_checksum(&[0xFF, 0xFF]), 0x00);
        assert_eq!(xor_checksum(&[0x01, 0x02, 0x04, 0x08]), 0x0F);
    }

    #[test]
    fn test_erase_all_checksum_is_consistent() {
        assert_eq!(xor_checksum(&ERASE_ALL[..2]), ERASE_ALL[2]);
    }

    #[test]
    fn test_address_frame() {
        assert_eq!(address_frame(0x0800_0000), [0x08, 0x00, 0x00, 0x00, 0x08]);
        assert_eq!(address_frame(0x0800_0100), [0x08, 0x00, 0x01, 0x00, 0x09]);
        assert_eq!(address_frame(0x1234_5678), [0x12, 0x34, 0x56, 0x78, 0x08]);
    }

    #[test]
    fn test_full_frames_xor_to_zero() {
        // Appending the checksum makes the XOR of the whole frame zero
        for addr in [0u32, 0x0800_0000, 0x0801_FF00, u32::MAX] {
            assert_eq!(xor_checksum(&address_frame(addr)), 0);
        }
        for len in [1usize, 2, 44, 255, 256] {
            let data: Vec<u8> = (0..len).map(|i| (i * 7 + 3) as u8).collect();
            assert_eq!(xor_checksum(&data_frame(&data)), 0);
        }
    }

    #[test]
    fn test_data_frame_layout() {
        let frame = data_frame(&[0x10, 0x20, 0x30]);
        assert_eq!(frame, vec![0x02, 0x10, 0x20, 0x30, 0x02 ^ 0x10 ^ 0x20 ^ 0x30]);

        let full = data_frame(&[0xAA; BLOCK_SIZE]);
        assert_eq!(full.len(), BLOCK_SIZE + 2);
        assert_eq!(full[0], 0xFF);
        // 256 copies of 0xAA cancel out
        assert_eq!(full[BLOCK_SIZE + 1], 0xFF);
    }

    #[test]
    fn test_describe_reply() {
        assert_eq!(describe_reply(ACK), "ACK");
        assert_eq!(describe_reply(NACK), "NACK");
        assert_eq!(describe_reply(0x00), "other");
    }
}
