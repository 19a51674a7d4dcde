//! Frame checksums
//!
//! CRC-8 covers the single control byte of a U-frame, CRC-16 covers the
//! sequence number and payload of an I-frame. Both are standard registry
//! algorithms; CRC-8/SMBUS reproduces the check constants the protocol
//! assigns to each control code.

const CRC8: crc::Crc<u8> = crc::Crc::<u8>::new(&crc::CRC_8_SMBUS);
const CRC16: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_ARC);

/// Compute the CRC-8 checksum of `data`
pub fn crc8(data: &[u8]) -> u8 {
    CRC8.checksum(data)
}

/// Compute the CRC-16 checksum of `data`
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc8_check_value() {
        // CRC-8/SMBUS standard check value
        assert_eq!(crc8(b"123456789"), 0xF4);
    }

    #[test]
    fn test_crc16_check_value() {
        // CRC-16/ARC standard check value
        assert_eq!(crc16(b"123456789"), 0xBB3D);
    }

    #[test]
    fn test_crc8_control_codes() {
        // Check bytes paired with the U-frame control codes
        assert_eq!(crc8(&[0x01]), 0x07);
        assert_eq!(crc8(&[0x02]), 0x0E);
        assert_eq!(crc8(&[0x04]), 0x1C);
        assert_eq!(crc8(&[0x08]), 0x38);
        assert_eq!(crc8(&[0x10]), 0x70);
        assert_eq!(crc8(&[0x20]), 0xE0);
        assert_eq!(crc8(&[0x40]), 0xC7);
        assert_eq!(crc8(&[0x80]), 0x89);
    }

    #[test]
    fn test_crc16_empty() {
        assert_eq!(crc16(&[]), 0);
    }
}
