// CRC-16 for frame integrity
//
// Reflected polynomial 0xA001, initial value 0xFFFF, no final XOR,
// one byte at a time, LSB first. Must stay bit-exact with the firmware.

const POLY: u16 = 0xA001;
const INIT: u16 = 0xFFFF;

/// Compute the frame checksum over `data`
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = INIT;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ POLY;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}
