use crate::error::*;

/// Reads an unsigned LEB128 integer of at most `bits` significant bits,
/// rejecting over-long encodings and out-of-range values.
#[inline]
pub fn read_leb128(bytes: &[u8], pc: &mut usize, bits: u32) -> Result<u64, Error> {
    let max_bytes = (bits as usize + 6) / 7;
    let mut result: u64 = 0;
    let mut consumed = 0usize;
    loop {
        if *pc + consumed >= bytes.len() {
            return malformed(UNEXPECTED_END);
        }
        let byte = bytes[*pc + consumed];
        consumed += 1;
        if consumed > max_bytes {
            return malformed(INT_TOO_LONG);
        }
        result |= ((byte & 0x7f) as u64) << (7 * (consumed - 1));
        if byte & 0x80 == 0 {
            // The final byte may only use the bits that fit in `bits`
            let used = 7 * (consumed - 1);
            let rem = bits as usize - used.min(bits as usize);
            if rem < 7 && (byte as u32) >> rem != 0 {
                return malformed(INT_TOO_LARGE);
            }
            break;
        }
    }
    *pc += consumed;
    Ok(result)
}

#[inline]
pub fn read_u32_leb(bytes: &[u8], pc: &mut usize) -> Result<u32, Error> {
    Ok(read_leb128(bytes, pc, 32)? as u32)
}

/// Reads a signed LEB128 integer of at most `bits` significant bits.
#[inline]
pub fn read_sleb128(bytes: &[u8], pc: &mut usize, bits: u32) -> Result<i64, Error> {
    let max_bytes = (bits as usize + 6) / 7;
    let mut result: i64 = 0;
    let mut shift: u32 = 0;
    let mut consumed = 0usize;
    let byte = loop {
        if *pc + consumed >= bytes.len() {
            return malformed(UNEXPECTED_END);
        }
        let byte = bytes[*pc + consumed];
        consumed += 1;
        if consumed > max_bytes {
            return malformed(INT_TOO_LONG);
        }
        if shift < 63 {
            result |= ((byte & 0x7f) as i64) << shift;
        }
        shift = (shift + 7).min(63);
        if byte & 0x80 == 0 {
            break byte;
        }
    };
    if shift < 64 && (byte & 0x40) != 0 {
        result |= (!0i64).checked_shl(shift).unwrap_or(!0i64);
    }
    // The unused high bits of the final byte must be a plain sign extension
    let used = 7 * (consumed as u32 - 1);
    if used < bits {
        let rem = bits - used;
        if rem < 7 {
            let high = (byte & 0x7f) >> (rem - 1);
            let sign_ext_ok = high == 0 || high == (0x7f >> (rem - 1));
            if !sign_ext_ok {
                return malformed(INT_TOO_LARGE);
            }
        }
    }
    match bits {
        32 => {
            if result < i32::MIN as i64 || result > i32::MAX as i64 {
                return malformed(INT_TOO_LARGE);
            }
        }
        33 => {
            if result < -(1i64 << 32) || result >= (1i64 << 32) {
                return malformed(INT_TOO_LARGE);
            }
        }
        64 => {}
        _ => unreachable!(),
    }
    *pc += consumed;
    Ok(result)
}

#[inline]
pub fn read_i32_leb(bytes: &[u8], pc: &mut usize) -> Result<i32, Error> {
    Ok(read_sleb128(bytes, pc, 32)? as i32)
}

#[inline]
pub fn read_i64_leb(bytes: &[u8], pc: &mut usize) -> Result<i64, Error> {
    read_sleb128(bytes, pc, 64)
}
