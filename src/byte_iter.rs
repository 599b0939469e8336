use crate::error::*;
use crate::leb128::*;

/// Bounds-checked cursor over the raw module bytes.
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
    pub fn has_n_left(&self, n: usize) -> bool {
        self.idx.checked_add(n).is_some_and(|end| end <= self.bytes.len())
    }
    #[inline]
    pub fn cur(&self) -> usize { self.idx }
    #[inline]
    pub fn advance(&mut self, n: usize) { self.idx += n; }

    #[inline]
    pub fn read_u8(&mut self) -> Result<u8, Error> {
        if self.idx >= self.bytes.len() { return malformed(UNEXPECTED_END); }
        let b = self.bytes[self.idx];
        self.idx += 1;
        Ok(b)
    }

    #[inline]
    pub fn peek_u8(&self) -> Result<u8, Error> {
        if self.idx >= self.bytes.len() { return malformed(UNEXPECTED_END); }
        Ok(self.bytes[self.idx])
    }

    #[inline]
    pub fn read_u32(&mut self) -> Result<u32, Error> {
        read_u32_leb(self.bytes, &mut self.idx)
    }

    #[inline]
    pub fn read_var(&mut self, bits: u32) -> Result<u64, Error> {
        read_leb128(self.bytes, &mut self.idx, bits)
    }

    #[inline]
    pub fn read_i32(&mut self) -> Result<i32, Error> {
        read_i32_leb(self.bytes, &mut self.idx)
    }

    #[inline]
    pub fn read_i64(&mut self) -> Result<i64, Error> {
        read_i64_leb(self.bytes, &mut self.idx)
    }

    #[inline]
    pub fn read_f32(&mut self) -> Result<f32, Error> {
        let raw = self.read_slice(4)?;
        Ok(f32::from_le_bytes(raw.try_into().unwrap()))
    }

    #[inline]
    pub fn read_f64(&mut self) -> Result<f64, Error> {
        let raw = self.read_slice(8)?;
        Ok(f64::from_le_bytes(raw.try_into().unwrap()))
    }

    #[inline]
    pub fn read_slice(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if !self.has_n_left(len) { return malformed(UNEXPECTED_END); }
        let out = &self.bytes[self.idx..self.idx + len];
        self.idx += len;
        Ok(out)
    }

    /// Reads a length-prefixed UTF-8 name.
    pub fn read_name(&mut self) -> Result<String, Error> {
        let len = self.read_u32()? as usize;
        let raw = self.read_slice(len)?;
        match std::str::from_utf8(raw) {
            Ok(s) => Ok(s.to_owned()),
            Err(_) => malformed(INVALID_UTF8),
        }
    }
}
