//! Bit, field and address helpers
//!
//! Pure functions over unsigned integers of any width. Range preconditions
//! (`lsb < msb`, widths that fit the word) are checked with `debug_assert!`
//! only; callers validate untrusted input before reaching these.

use std::ops::{BitAnd, BitOr, Not, Rem, Shl, Shr};

/// Unsigned word that the bit helpers operate on
pub trait BitWord:
    Copy
    + PartialEq
    + Shl<u32, Output = Self>
    + Shr<u32, Output = Self>
    + BitAnd<Output = Self>
    + BitOr<Output = Self>
    + Not<Output = Self>
{
    const WIDTH: u32;
    const ZERO: Self;
    const ONE: Self;

    /// Mask with the lowest `width` bits set (all bits for `width >= WIDTH`)
    fn low_mask(width: u32) -> Self;
}

macro_rules! impl_bit_word {
    ($($t:ty),*) => {
        $(
            impl BitWord for $t {
                const WIDTH: u32 = <$t>::BITS;
                const ZERO: Self = 0;
                const ONE: Self = 1;

                #[inline]
                fn low_mask(width: u32) -> Self {
                    match <$t>::MAX.checked_shl(width) {
                        Some(shifted) if width < Self::WIDTH => !shifted,
                        _ => <$t>::MAX,
                    }
                }
            }
        )*
    };
}

impl_bit_word!(u8, u16, u32, u64, usize);

/// Is `x` a multiple of `y`
///
/// Zero is not considered a multiple of anything (`x >= y` is required),
/// and nothing is a multiple of zero.
#[inline]
pub fn is_multiple<T>(x: T, y: T) -> bool
where
    T: Copy + PartialOrd + Rem<Output = T> + Default,
{
    y != T::default() && x >= y && x % y == T::default()
}

#[inline]
pub fn get_lower_32_bits(x: u64) -> u32 {
    (x & 0xFFFF_FFFF) as u32
}

#[inline]
pub fn get_upper_32_bits(x: u64) -> u32 {
    ((x >> 32) & 0xFFFF_FFFF) as u32
}

/// Join a register pair back into a 64-bit value
#[inline]
pub fn join_32_bits(lower: u32, upper: u32) -> u64 {
    (u64::from(upper) << 32) | u64::from(lower)
}

#[inline]
pub fn get_bit<T: BitWord>(x: T, index: u32) -> bool {
    debug_assert!(index < T::WIDTH, "bit index {} out of range", index);
    (x >> index) & T::ONE == T::ONE
}

#[inline]
pub fn set_bit<T: BitWord>(bits: &mut T, index: u32, value: bool) {
    debug_assert!(index < T::WIDTH, "bit index {} out of range", index);
    let mask = T::ONE << index;
    if value {
        *bits = *bits | mask;
    } else {
        *bits = *bits & !mask;
    }
}

/// Extract the inclusive bit range `lsb..=msb`
#[inline]
pub fn get_bits<T: BitWord>(x: T, lsb: u32, msb: u32) -> T {
    debug_assert!(lsb < msb, "lsb {} must be below msb {}", lsb, msb);
    debug_assert!(msb < T::WIDTH, "msb {} out of range", msb);
    (x >> lsb) & T::low_mask(msb - lsb + 1)
}

/// Overwrite `width` bits starting at `index` with the low bits of `value`
#[inline]
pub fn set_bits<T: BitWord>(bits: &mut T, index: u32, width: u32, value: T) {
    debug_assert!(width > 0, "field width must be non-zero");
    debug_assert!(index + width <= T::WIDTH, "field {}+{} does not fit", index, width);
    let mask = T::low_mask(width) << index;
    *bits = (*bits & !mask) | ((value << index) & mask);
}

/// Number of consecutive set bits starting at bit 0
#[inline]
pub fn get_width<T: BitWord>(mut x: T) -> u32 {
    let mut length = 0;
    while length < T::WIDTH && x & T::ONE == T::ONE {
        length += 1;
        x = x >> 1;
    }
    length
}

/// Offset a pointer by a given amount of bytes
#[inline]
pub fn offset_bytes<T>(pointer: *mut T, bytes: usize) -> *mut T {
    pointer.cast::<u8>().wrapping_add(bytes).cast()
}

/// Difference in bytes between two pointers
#[inline]
pub fn pointer_diff<T>(a: *const T, b: *const T) -> isize {
    (a as usize).wrapping_sub(b as usize) as isize
}

/// False for a zero alignment
#[inline]
pub fn check_alignment(address: usize, alignment: usize) -> bool {
    alignment != 0 && address % alignment == 0
}

/// Parse a decimal or `0x`-prefixed hexadecimal number
pub fn parse_number(text: &str) -> Result<u64, std::num::ParseIntError> {
    let text = text.trim();
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_multiple_requires_x_at_least_y() {
        assert!(is_multiple(8u32, 4));
        assert!(is_multiple(4u32, 4));
        assert!(!is_multiple(3u32, 4));
        assert!(!is_multiple(6u32, 4));
        assert!(!is_multiple(0usize, 4));
        assert!(is_multiple(0x0f00040usize, 4));
    }

    #[test]
    fn zero_divisors_are_rejected() {
        assert!(!is_multiple(8usize, 0));
        assert!(!is_multiple(0u32, 0));
        assert!(!check_alignment(0x1000, 0));
    }

    #[test]
    fn set_bit_then_get_bit_leaves_other_bits() {
        for &x in &[0u32, 0xFFFF_FFFF, 0xA5A5_5A5A, 0x18] {
            for i in 0..32 {
                for &v in &[false, true] {
                    let mut y = x;
                    set_bit(&mut y, i, v);
                    assert_eq!(get_bit(y, i), v);
                    assert_eq!(y & !(1 << i), x & !(1 << i));
                }
            }
        }
    }

    #[test]
    fn set_bits_then_get_bits_round_trips_field() {
        let x: u32 = 0xDEAD_BEEF;
        for lsb in 0..31u32 {
            for msb in (lsb + 1)..32 {
                let width = msb - lsb + 1;
                let value = 0x5555_5555u32 & u32::low_mask(width);
                let mut y = x;
                set_bits(&mut y, lsb, width, value);
                assert_eq!(get_bits(y, lsb, msb), value);
                let outside = !(u32::low_mask(width) << lsb);
                assert_eq!(y & outside, x & outside);
            }
        }
    }

    #[test]
    fn full_width_fields() {
        let mut x = 0u64;
        set_bits(&mut x, 0, 64, 0x0123_4567_89AB_CDEF);
        assert_eq!(x, 0x0123_4567_89AB_CDEF);
        assert_eq!(get_bits(x, 0, 63), x);
        assert_eq!(get_bits(0xF0u8, 4, 7), 0xF);
    }

    #[test]
    fn splits_wide_values() {
        let x = 0x1122_3344_5566_7788u64;
        assert_eq!(get_lower_32_bits(x), 0x5566_7788);
        assert_eq!(get_upper_32_bits(x), 0x1122_3344);
        assert_eq!(join_32_bits(get_lower_32_bits(x), get_upper_32_bits(x)), x);
    }

    #[test]
    fn width_counts_trailing_ones() {
        assert_eq!(get_width(0u32), 0);
        assert_eq!(get_width(0b0111u32), 3);
        assert_eq!(get_width(0b1011u8), 2);
        assert_eq!(get_width(u16::MAX), 16);
    }

    #[test]
    fn pointer_helpers() {
        let mut words = [0u32; 4];
        let base = words.as_mut_ptr();
        let third = offset_bytes(base, 8);
        assert_eq!(pointer_diff(third as *const u32, base as *const u32), 8);
        assert!(check_alignment(third as usize, 4));
        assert!(check_alignment(0x1000, 0x1000));
        assert!(!check_alignment(0x1001, 4));
    }

    #[test]
    fn parses_hex_and_decimal() {
        assert_eq!(parse_number("0x0f00040").ok(), Some(0x0f00040));
        assert_eq!(parse_number("0X18").ok(), Some(0x18));
        assert_eq!(parse_number("100000").ok(), Some(100_000));
        assert!(parse_number("0xzz").is_err());
    }
}
