use crate::error::*;
use crate::leb128::*;

/// Cursor over a module binary.
#[derive(Clone, Copy)]
pub struct ByteIter<'a> {
    pub bytes: &'a [u8],
    pub idx: usize,
}

impl<'a> ByteIter<'a> {
    #[inline]
    pub fn new(bytes: &'a [u8], idx: usize) -> Self { Self { bytes, idx } }
    #[inline]
    pub fn empty(&self) -> bool { self.idx >= self.bytes.len() }
    #[inline]
    pub fn has_n_left(&self, n: usize) -> bool { self.idx.saturating_add(n) <= self.bytes.len() }
    #[inline]
    pub fn cur(&self) -> usize { self.idx }
    #[inline]
    pub fn advance(&mut self, n: usize) { self.idx += n; }
    #[inline]
    pub fn read_u8(&mut self) -> Result<u8, Error> {
        let b = *self.bytes.get(self.idx).ok_or(Error::Malformed(UNEXPECTED_END))?;
        self.idx += 1;
        Ok(b)
    }
    #[inline]
    pub fn peek_u8(&self) -> Result<u8, Error> {
        self.bytes.get(self.idx).copied().ok_or(Error::Malformed(UNEXPECTED_END))
    }
    #[inline]
    pub fn read_u32(&mut self) -> Result<u32, Error> { safe_read_leb128(self.bytes, &mut self.idx, 32) }
    #[inline]
    pub fn read_u64(&mut self) -> Result<u64, Error> { safe_read_leb128(self.bytes, &mut self.idx, 64) }
    #[inline]
    pub fn read_i32(&mut self) -> Result<i32, Error> { safe_read_sleb128(self.bytes, &mut self.idx, 32) }
    #[inline]
    pub fn read_i33(&mut self) -> Result<i64, Error> { safe_read_sleb128(self.bytes, &mut self.idx, 33) }
    #[inline]
    pub fn read_i64(&mut self) -> Result<i64, Error> { safe_read_sleb128(self.bytes, &mut self.idx, 64) }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], Error> {
        let end = self.idx.checked_add(len).ok_or(Error::Malformed(UNEXPECTED_END_SHORT))?;
        let out = self.bytes.get(self.idx..end).ok_or(Error::Malformed(UNEXPECTED_END_SHORT))?;
        self.idx = end;
        Ok(out)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_name(&mut self) -> Result<String, Error> {
        let len = self.read_u32()? as usize;
        let raw = self.read_bytes(len)?;
        std::str::from_utf8(raw).map(str::to_owned).map_err(|_| Error::Malformed(INVALID_UTF8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_names_and_fixed_width() {
        let bytes = [3, b'a', b'b', b'c', 0x00, 0x00, 0x80, 0x3f];
        let mut it = ByteIter::new(&bytes, 0);
        assert_eq!(it.read_name().unwrap(), "abc");
        assert_eq!(f32::from_bits(u32::from_le_bytes(it.read_array().unwrap())), 1.0);
        assert!(it.empty());
        assert_eq!(it.read_u8(), Err(Error::Malformed(UNEXPECTED_END)));
    }

    #[test]
    fn rejects_invalid_utf8_names() {
        let bytes = [2, 0xc3, 0x28];
        assert_eq!(ByteIter::new(&bytes, 0).read_name(), Err(Error::Malformed(INVALID_UTF8)));
    }
}
