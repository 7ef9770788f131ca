//! Checksum validation for both telegram formats.
//!
//! Both algorithms are the classic table-free bit-shift CRC16, differing in
//! initial register, feedback polynomial and final value. ASCII telegrams
//! carry an ARC-style checksum, binary frames an X25-style one.

/// CRC16/ARC: initial register 0, reflected polynomial 0xA001.
///
/// Used for ASCII telegrams, computed over the payload up to and including
/// the `!` terminator.
pub fn crc16_arc(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// CRC16/X25: initial register 0xFFFF, reflected polynomial 0x8408, final
/// value inverted.
///
/// Used for binary frames, computed from after the opening flag up to the
/// checksum field.
pub fn crc16_x25(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0x8408;
            } else {
                crc >>= 1;
            }
        }
    }
    crc ^ 0xFFFF
}
