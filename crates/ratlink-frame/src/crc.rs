//! CRC-16 used for the DDT2 payload checksum.
//!
//! Polynomial 0x1021, initial value 0, shifted bit by bit with the message
//! bits fed in at the bottom, then flushed with two zero bytes. The result is
//! the same as CRC-16/XMODEM.

const POLY: u16 = 0x1021;

fn update(byte: u8, mut crc: u16) -> u16 {
    let mut c = u16::from(byte);
    for _ in 0..8 {
        c <<= 1;
        let bit = (c >> 8) & 1;
        if crc & 0x8000 != 0 {
            crc = (crc << 1).wrapping_add(bit) ^ POLY;
        } else {
            crc = (crc << 1).wrapping_add(bit);
        }
    }
    crc
}

/// Checksum `data`.
pub fn crc16(data: &[u8]) -> u16 {
    let crc = data.iter().fold(0u16, |crc, &byte| update(byte, crc));
    update(0, update(0, crc))
}
