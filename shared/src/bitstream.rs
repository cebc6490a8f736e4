//! Bit-granular writer and reader used by the input codec.
//!
//! Bits are packed least-significant first within each byte. The final byte
//! is zero padded.

use crate::error::ProtocolError;

#[derive(Debug, Default)]
pub struct BitWriter {
    buffer: Vec<u8>,
    scratch: u8,
    scratch_bits: u8,
    bits_written: u32,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_bit(&mut self, bit: bool) {
        if bit {
            self.scratch |= 1 << self.scratch_bits;
        }
        self.scratch_bits += 1;
        self.bits_written += 1;

        if self.scratch_bits == 8 {
            self.buffer.push(self.scratch);
            self.scratch = 0;
            self.scratch_bits = 0;
        }
    }

    /// Writes the low `bits` bits of `value`, least significant first.
    pub fn write_bits(&mut self, value: u64, bits: u8) {
        debug_assert!(bits <= 64);
        for i in 0..bits {
            self.write_bit((value >> i) & 1 != 0);
        }
    }

    pub fn write_i32(&mut self, value: i32) {
        self.write_bits(value as u32 as u64, 32);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.write_bits(value, 64);
    }

    pub fn bits_written(&self) -> u32 {
        self.bits_written
    }

    pub fn into_bytes(mut self) -> Vec<u8> {
        if self.scratch_bits > 0 {
            self.buffer.push(self.scratch);
        }
        self.buffer
    }
}

pub struct BitReader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    pub fn remaining_bits(&self) -> usize {
        self.bytes.len() * 8 - self.position
    }

    pub fn read_bit(&mut self) -> Result<bool, ProtocolError> {
        if self.position >= self.bytes.len() * 8 {
            return Err(ProtocolError::Truncated { needed: 1 });
        }
        let byte = self.bytes[self.position / 8];
        let bit = (byte >> (self.position % 8)) & 1 != 0;
        self.position += 1;
        Ok(bit)
    }

    pub fn read_bits(&mut self, bits: u8) -> Result<u64, ProtocolError> {
        if (bits as usize) > self.remaining_bits() {
            return Err(ProtocolError::Truncated {
                needed: bits as u32 - self.remaining_bits() as u32,
            });
        }
        let mut value = 0u64;
        for i in 0..bits {
            if self.read_bit()? {
                value |= 1 << i;
            }
        }
        Ok(value)
    }

    pub fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(self.read_bits(32)? as u32 as i32)
    }

    pub fn read_u64(&mut self) -> Result<u64, ProtocolError> {
        self.read_bits(64)
    }

    /// Succeeds only if everything left is zero padding in the final byte.
    pub fn finish(self) -> Result<(), ProtocolError> {
        let remaining = self.remaining_bits();
        if remaining >= 8 {
            return Err(ProtocolError::TrailingBytes {
                bytes: remaining / 8,
            });
        }
        if remaining > 0 {
            let last = self.bytes[self.bytes.len() - 1];
            if last >> (8 - remaining) != 0 {
                return Err(ProtocolError::Malformed("non-zero padding".to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_bits_lsb_first() {
        let mut writer = BitWriter::new();
        writer.write_bit(true);
        writer.write_bit(false);
        writer.write_bit(true);
        assert_eq!(writer.bits_written(), 3);
        assert_eq!(writer.into_bytes(), vec![0b0000_0101]);
    }

    #[test]
    fn test_mixed_widths_read_back() {
        let mut writer = BitWriter::new();
        writer.write_bits(0b1011, 4);
        writer.write_i32(-42);
        writer.write_bits(63, 6);
        writer.write_u64(u64::MAX - 7);
        let bytes = writer.into_bytes();

        let mut reader = BitReader::new(&bytes);
        assert_eq!(reader.read_bits(4).unwrap(), 0b1011);
        assert_eq!(reader.read_i32().unwrap(), -42);
        assert_eq!(reader.read_bits(6).unwrap(), 63);
        assert_eq!(reader.read_u64().unwrap(), u64::MAX - 7);
        assert!(reader.finish().is_ok());
    }

    #[test]
    fn test_truncated_read_fails() {
        let bytes = [0xFFu8];
        let mut reader = BitReader::new(&bytes);
        assert!(reader.read_bits(6).is_ok());
        assert_eq!(
            reader.read_bits(4),
            Err(ProtocolError::Truncated { needed: 2 })
        );
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let bytes = [0x01u8, 0x00];
        let mut reader = BitReader::new(&bytes);
        reader.read_bit().unwrap();
        assert_eq!(
            reader.finish(),
            Err(ProtocolError::TrailingBytes { bytes: 1 })
        );
    }

    #[test]
    fn test_dirty_padding_rejected() {
        let bytes = [0b1000_0001u8];
        let mut reader = BitReader::new(&bytes);
        reader.read_bit().unwrap();
        assert!(reader.finish().is_err());
    }
}
