//! Bit and byte helpers shared by the layout, codec and logging code.
//!
//! PLC data blocks are addressed with a single bit offset: byte `offset / 8`,
//! bit `offset % 8` (bit 0 is the LSB of the byte). These helpers keep that
//! arithmetic in one place.
//!
//! # Example
//!
//! ```
//! use plc_gateway::utils::{align_up, get_bit, with_bit, format_bytes};
//!
//! // Next 16-bit boundary after bit 3
//! assert_eq!(align_up(3, 16), 16);
//!
//! let byte = with_bit(0, 2, true);
//! assert_eq!(byte, 0b0000_0100);
//! assert!(get_bit(byte, 2));
//!
//! assert_eq!(format_bytes(&[0x01, 0xAB]), "01 AB");
//! ```

use std::fmt::Write;

/// Rounds `offset` up to the nearest multiple of `alignment`.
///
/// An offset already on the boundary is returned unchanged. An alignment
/// of 0 or 1 leaves the offset as is.
///
/// # Example
///
/// ```
/// use plc_gateway::utils::align_up;
///
/// assert_eq!(align_up(0, 16), 0);
/// assert_eq!(align_up(1, 16), 16);
/// assert_eq!(align_up(32, 16), 32);
/// assert_eq!(align_up(7, 1), 7);
/// ```
#[inline]
pub fn align_up(offset: u32, alignment: u32) -> u32 {
    if alignment <= 1 || offset % alignment == 0 {
        offset
    } else {
        (offset / alignment + 1) * alignment
    }
}

/// Gets a single bit from a byte.
///
/// # Arguments
///
/// * `value` - The byte to extract from
/// * `bit` - Bit position (0-7, where 0 is LSB)
///
/// # Example
///
/// ```
/// use plc_gateway::utils::get_bit;
///
/// assert!(get_bit(0b0000_0101, 0));
/// assert!(!get_bit(0b0000_0101, 1));
/// assert!(get_bit(0b0000_0101, 2));
/// ```
#[inline]
pub fn get_bit(value: u8, bit: u8) -> bool {
    (value & (1 << (bit & 7))) != 0
}

/// Returns `value` with a single bit set or cleared.
///
/// # Example
///
/// ```
/// use plc_gateway::utils::with_bit;
///
/// assert_eq!(with_bit(0, 7, true), 0x80);
/// assert_eq!(with_bit(0xFF, 0, false), 0xFE);
/// ```
#[inline]
pub fn with_bit(value: u8, bit: u8, state: bool) -> u8 {
    let mask = 1 << (bit & 7);
    if state {
        value | mask
    } else {
        value & !mask
    }
}

/// Splits a bit offset into its byte offset and bit index.
///
/// # Example
///
/// ```
/// use plc_gateway::utils::split_bit_offset;
///
/// assert_eq!(split_bit_offset(10), (1, 2));
/// ```
#[inline]
pub fn split_bit_offset(bit_offset: u32) -> (usize, u8) {
    ((bit_offset / 8) as usize, (bit_offset % 8) as u8)
}

/// Formats bytes as space-separated upper-case hex, for log output.
///
/// # Example
///
/// ```
/// use plc_gateway::utils::format_bytes;
///
/// assert_eq!(format_bytes(&[]), "");
/// assert_eq!(format_bytes(&[0x0A, 0xFF, 0x00]), "0A FF 00");
/// ```
pub fn format_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02X}", byte);
    }
    out
}
