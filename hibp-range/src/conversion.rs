/// Convert prefix u32 to 5-char uppercase hex string (stack allocated)
#[inline]
pub fn prefix_to_hex(prefix: u32) -> [u8; 5] {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    [
        HEX[((prefix >> 16) & 0xF) as usize],
        HEX[((prefix >> 12) & 0xF) as usize],
        HEX[((prefix >> 8) & 0xF) as usize],
        HEX[((prefix >> 4) & 0xF) as usize],
        HEX[(prefix & 0xF) as usize],
    ]
}

/// View a [`prefix_to_hex`] result as a string.
#[inline]
pub fn prefix_str(prefix_hex: &[u8; 5]) -> &str {
    // SAFETY: prefix_to_hex only emits ASCII hex digits
    unsafe { std::str::from_utf8_unchecked(prefix_hex) }
}

/// Parse a 5-char hex prefix (either case) back to its numeric value.
pub fn hex_to_prefix(s: &str) -> Option<u32> {
    if s.len() != 5 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(s, 16).ok()
}
