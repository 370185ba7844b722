//! Address arithmetic over fixed-width keys.
//!
//! Addresses are carried as `u128` regardless of family; `bits` is the width
//! of the family (32 for IPv4, 128 for IPv6). IPv4 lives in the low 32 bits,
//! which keeps the four-word storage layout (`a1..a4`) with only `a4` set.

use crate::errors::{Error, Result};

/// Network mask for `prefix_len` within a `bits`-wide address.
#[inline]
pub fn mask(prefix_len: u8, bits: u8) -> u128 {
    debug_assert!(prefix_len <= bits && bits <= 128);
    let width = width_mask(bits);
    if prefix_len == 0 {
        0
    } else if prefix_len >= bits {
        width
    } else {
        width & !(width >> prefix_len)
    }
}

/// All ones over the family width.
#[inline]
pub fn width_mask(bits: u8) -> u128 {
    if bits >= 128 {
        !0u128
    } else {
        (1u128 << bits) - 1
    }
}

/// Host part mask (`size - 1`), total even for `::/0`.
#[inline]
pub fn host_mask(prefix_len: u8, bits: u8) -> u128 {
    width_mask(bits) & !mask(prefix_len, bits)
}

// Zero the host bits beyond `prefix_len`.
#[inline(always)]
pub fn canonical(addr: u128, prefix_len: u8, bits: u8) -> u128 {
    addr & mask(prefix_len, bits)
}

/// Last (broadcast) address of the block.
#[inline]
pub fn last(addr: u128, prefix_len: u8, bits: u8) -> u128 {
    canonical(addr, prefix_len, bits) | host_mask(prefix_len, bits)
}

/// Number of addresses in the block: `2^(bits - prefix_len)`.
/// `None` only for the whole IPv6 space, which does not fit in a `u128`.
#[inline]
pub fn size(prefix_len: u8, bits: u8) -> Option<u128> {
    1u128.checked_shl(u32::from(bits - prefix_len))
}

/// Bit `index` counted from the most significant bit of the family.
#[inline]
pub fn get_bit(addr: u128, index: u8, bits: u8) -> u8 {
    debug_assert!(index < bits);
    ((addr >> (bits - 1 - index)) & 1) as u8
}

/// The two blocks one level deeper. `None` for a host route.
pub fn halves(addr: u128, prefix_len: u8, bits: u8) -> Option<(u128, u128)> {
    if prefix_len >= bits {
        return None;
    }
    let lo = canonical(addr, prefix_len, bits);
    let hi = lo | (1u128 << (bits - 1 - prefix_len));
    Some((lo, hi))
}

/// The other half of the immediate parent, found by flipping the last
/// network bit. The address-space root has no sibling.
pub fn sibling(addr: u128, prefix_len: u8, bits: u8) -> Result<u128> {
    if prefix_len == 0 {
        return Err(Error::Invariant(
            "the address-space root (/0) has no sibling".into(),
        ));
    }
    if prefix_len > bits {
        return Err(Error::InvalidPrefix(format!(
            "prefix length {prefix_len} exceeds {bits} bits"
        )));
    }
    let flip = 1u128 << (bits - prefix_len);
    Ok(canonical(addr, prefix_len, bits) ^ flip)
}

/// Does `outer` (addr/len) cover `inner` (addr/len)? Equal blocks count.
#[inline]
pub fn contains(outer: u128, outer_len: u8, inner: u128, inner_len: u8, bits: u8) -> bool {
    inner_len >= outer_len && canonical(inner, outer_len, bits) == canonical(outer, outer_len, bits)
}

/// Split into four 32-bit words, most significant first.
#[inline]
pub fn split_words(v: u128) -> [u32; 4] {
    [
        (v >> 96) as u32,
        (v >> 64) as u32,
        (v >> 32) as u32,
        v as u32,
    ]
}

#[inline]
pub fn join_words(w: [u32; 4]) -> u128 {
    (u128::from(w[0]) << 96) | (u128::from(w[1]) << 64) | (u128::from(w[2]) << 32) | u128::from(w[3])
}
