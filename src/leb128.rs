use crate::error::Error::*;
use crate::error::*;

/// Reads an unsigned LEB128 integer of at most `bits` payload bits.
#[inline]
pub fn safe_read_leb128<T>(bytes: &[u8], pc: &mut usize, bits: u32) -> Result<T, Error>
where T: TryFrom<u64> {
    let max_bytes = bits.div_ceil(7) as usize;
    let mut result: u64 = 0;
    let mut shift: u32 = 0;
    let mut end = *pc;
    loop {
        let byte = *bytes.get(end).ok_or(Malformed(UNEXPECTED_END))?;
        end += 1;
        if end - *pc == max_bytes {
            if byte & 0x80 != 0 { return Err(Malformed(INT_TOO_LONG)); }
            let rem = bits - shift;
            if rem < 7 && (byte & 0x7f) >> rem != 0 { return Err(Malformed(INT_TOO_LARGE)); }
        }
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 { break; }
        shift += 7;
    }
    *pc = end;
    T::try_from(result).map_err(|_| Malformed(INT_TOO_LARGE))
}

/// Reads a signed LEB128 integer of at most `bits` payload bits.
#[inline]
pub fn safe_read_sleb128<T>(bytes: &[u8], pc: &mut usize, bits: u32) -> Result<T, Error>
where T: TryFrom<i64> {
    let max_bytes = bits.div_ceil(7) as usize;
    let mut result: i64 = 0;
    let mut shift: u32 = 0;
    let mut end = *pc;
    loop {
        let byte = *bytes.get(end).ok_or(Malformed(UNEXPECTED_END))?;
        end += 1;
        if end - *pc == max_bytes {
            if byte & 0x80 != 0 { return Err(Malformed(INT_TOO_LONG)); }
            let rem = bits - shift;
            if rem < 7 {
                // the unused high bits must replicate the sign bit
                let tail = (byte & 0x7f) >> (rem - 1);
                if tail != 0 && tail != (0x7f >> (rem - 1)) { return Err(Malformed(INT_TOO_LARGE)); }
            }
        }
        result |= ((byte & 0x7f) as i64) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            if shift < 64 && byte & 0x40 != 0 { result |= -1i64 << shift; }
            break;
        }
    }
    *pc = end;
    T::try_from(result).map_err(|_| Malformed(INT_TOO_LARGE))
}
