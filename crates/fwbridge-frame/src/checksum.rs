//! Checksum algorithms used by the wire protocols.

/// Low-nibble lookup for the 1-wire CRC8 (X^8 + X^5 + X^4 + 1, reflected).
const CRC8_LOW: [u8; 16] = [
    0x00, 0x5e, 0xbc, 0xe2, 0x61, 0x3f, 0xdd, 0x83, 0xc2, 0x9c, 0x7e, 0x20, 0xa3, 0xfd, 0x1f, 0x41,
];

/// High-nibble lookup for the 1-wire CRC8.
const CRC8_HIGH: [u8; 16] = [
    0x00, 0x9d, 0x23, 0xbe, 0x46, 0xdb, 0x65, 0xf8, 0x8c, 0x11, 0xaf, 0x32, 0xca, 0x57, 0xe9, 0x74,
];

/// Running 1-wire CRC8 accumulator.
///
/// Updated byte by byte through two 16-entry nibble tables. Used by the
/// binary RPC framing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Crc8 {
    value: u8,
}

impl Crc8 {
    /// A fresh accumulator (initial value zero).
    pub const fn new() -> Self {
        Self { value: 0 }
    }

    /// Fold one byte into the accumulator.
    pub fn update_byte(&mut self, byte: u8) -> u8 {
        let x = byte ^ self.value;
        self.value = CRC8_LOW[(x & 0x0f) as usize] ^ CRC8_HIGH[(x >> 4) as usize];
        self.value
    }

    /// Fold a slice into the accumulator and return the current value.
    pub fn update(&mut self, data: &[u8]) -> u8 {
        for &byte in data {
            self.update_byte(byte);
        }
        self.value
    }

    /// Current accumulator value.
    pub fn value(&self) -> u8 {
        self.value
    }
}

/// CRC8 of a complete buffer.
pub fn crc8(data: &[u8]) -> u8 {
    Crc8::new().update(data)
}

/// Running 8-bit modular sum, as used by the GDB remote serial protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModSum {
    value: u8,
}

impl ModSum {
    pub const fn new() -> Self {
        Self { value: 0 }
    }

    pub fn update(&mut self, data: &[u8]) -> u8 {
        for &byte in data {
            self.value = self.value.wrapping_add(byte);
        }
        self.value
    }

    pub fn value(&self) -> u8 {
        self.value
    }
}

/// Sum of all bytes modulo 256.
pub fn modsum(data: &[u8]) -> u8 {
    ModSum::new().update(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc8_check_value() {
        // CRC-8/MAXIM-DOW check value.
        assert_eq!(crc8(b"123456789"), 0xa1);
    }

    #[test]
    fn crc8_known_messages() {
        assert_eq!(crc8(&[]), 0x00);
        assert_eq!(crc8(&[0x41]), 0x18);
        assert_eq!(crc8(&[0xb1]), 0x6c);
        assert_eq!(crc8(&[0x01, 0x00, 0x10, 0x00, 0x00, 0x04]), 0x6e);
        assert_eq!(crc8(&[0x91, 0x78, 0x56, 0x34, 0x12]), 0x53);
    }

    #[test]
    fn crc8_incremental_matches_oneshot() {
        let data = b"avatar stub message payload";
        let mut crc = Crc8::new();
        crc.update(&data[..7]);
        for &b in &data[7..] {
            crc.update_byte(b);
        }
        assert_eq!(crc.value(), crc8(data));
        assert_eq!(crc8(data), crc8(data));
    }

    #[test]
    fn crc8_detects_every_single_bit_flip() {
        let data = [0x02, 0x55, 0xaa, 0x00, 0x00, 0x01, 0x55];
        let reference = crc8(&data);
        for index in 0..data.len() {
            for bit in 0..8 {
                let mut corrupted = data;
                corrupted[index] ^= 1 << bit;
                assert_ne!(crc8(&corrupted), reference, "byte {index} bit {bit}");
            }
        }
    }

    #[test]
    fn modsum_values() {
        assert_eq!(modsum(b""), 0x00);
        assert_eq!(modsum(b"OK"), 0x9a);
        assert_eq!(modsum(b"S05"), 0xb8);
        assert_eq!(modsum(b"g"), 0x67);
        assert_eq!(modsum(&[0xff, 0x02]), 0x01);

        let mut sum = ModSum::new();
        sum.update(b"m1000");
        sum.update(b",4");
        assert_eq!(sum.value(), modsum(b"m1000,4"));
    }
}
