use bitvec::prelude::*;

/// Growable bit sequence with a read cursor.
///
/// The frame synchronizer appends demodulated bits, the telegram decoder
/// consumes them a byte at a time (MSB first).
#[derive(Debug, Default, Clone)]
pub struct BitBuffer {
    bits: BitVec<u8, Msb0>,
    cursor: usize,
}

impl BitBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            bits: BitVec::from_slice(bytes),
            cursor: 0,
        }
    }

    pub fn clear(&mut self) {
        self.bits.clear();
        self.cursor = 0;
    }

    pub fn push(&mut self, bit: bool) {
        self.bits.push(bit);
    }

    /// Bits not consumed yet
    pub fn available(&self) -> usize {
        self.bits.len() - self.cursor
    }

    pub fn read_byte(&mut self) -> Option<u8> {
        if self.available() < 8 {
            return None;
        }
        let byte = self.bits[self.cursor..self.cursor + 8].load_be::<u8>();
        self.cursor += 8;
        Some(byte)
    }

    pub fn unread(&self) -> &BitSlice<u8, Msb0> {
        &self.bits[self.cursor..]
    }
}

/// Position of the last occurrence of `pattern` in `bits`
pub fn rfind_pattern(bits: &BitSlice<u8, Msb0>, pattern: &BitSlice<u8, Msb0>) -> Option<usize> {
    if pattern.is_empty() || bits.len() < pattern.len() {
        return None;
    }
    let mut found = None;
    for (i, window) in bits.windows(pattern.len()).enumerate() {
        if window == pattern {
            found = Some(i);
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_bytes_msb_first() {
        let mut buf = BitBuffer::new();
        for bit in [false, true, false, true, false, true, false, true, true] {
            buf.push(bit);
        }
        assert_eq!(buf.read_byte(), Some(0x55));
        assert_eq!(buf.available(), 1);
        assert_eq!(buf.read_byte(), None);
    }

    #[test]
    fn test_rfind_pattern_takes_last_match() {
        let bits = BitVec::<u8, Msb0>::from_slice(&[0xFF, 0x55, 0x00, 0xFF, 0x55]);
        let marker = BitVec::<u8, Msb0>::from_slice(&[0xFF, 0x55]);
        assert_eq!(rfind_pattern(&bits, &marker), Some(24));
        let none = BitVec::<u8, Msb0>::from_slice(&[0x12, 0x34]);
        assert_eq!(rfind_pattern(&none, &marker), None);
    }
}
