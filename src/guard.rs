//! Trailing guard bytes.
//!
//! Every tracked block is laid out as `[payload: size][guard: GUARD_LEN]`.  The guard is
//! filled with a fixed pattern when the block is handed out or resized, and re-read on
//! every free, every resize and on demand during an overflow scan.  A single differing
//! byte means the program wrote past the end of its payload.

/// Number of guard bytes appended to every payload.
pub(crate) const GUARD_LEN: usize = 32;

const GUARD_BYTE: u8 = 0xcb;

/// Size of the underlying block needed to hold `size` payload bytes plus the guard,
/// or `None` if that does not fit in a `usize`.
pub(crate) fn padded_len(size: usize) -> Option<usize> {
    size.checked_add(GUARD_LEN)
}

/// Fill the guard region that follows `size` payload bytes at `base`.
///
/// # Safety
///
/// `base` must point to a block of at least `size + GUARD_LEN` writable bytes.
pub(crate) unsafe fn arm(base: *mut u8, size: usize) {
    std::ptr::write_bytes(base.add(size), GUARD_BYTE, GUARD_LEN);
}

/// Returns `true` if the guard that follows `size` payload bytes at `base` still holds
/// the expected pattern.
///
/// # Safety
///
/// `base` must point to a block of at least `size + GUARD_LEN` readable bytes.
pub(crate) unsafe fn is_intact(base: *const u8, size: usize) -> bool {
    let guard = std::slice::from_raw_parts(base.add(size), GUARD_LEN);
    guard.iter().all(|b| *b == GUARD_BYTE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn armed_block(size: usize) -> Vec<u8> {
        let mut block = vec![0u8; padded_len(size).unwrap()];
        unsafe { arm(block.as_mut_ptr(), size) };
        block
    }

    #[test]
    fn payload_writes_keep_guard_intact() {
        let mut block = armed_block(10);
        for b in block[..10].iter_mut() {
            *b = 0xff;
        }
        assert!(unsafe { is_intact(block.as_ptr(), 10) });
    }

    #[test]
    fn any_guard_byte_write_is_detected() {
        for offset in 0..GUARD_LEN {
            let mut block = armed_block(10);
            block[10 + offset] = 0;
            assert!(!unsafe { is_intact(block.as_ptr(), 10) }, "offset {}", offset);
        }
    }

    #[test]
    fn zero_length_payload_has_a_guard() {
        let mut block = armed_block(0);
        assert!(unsafe { is_intact(block.as_ptr(), 0) });
        block[0] = b'x';
        assert!(!unsafe { is_intact(block.as_ptr(), 0) });
    }

    #[test]
    fn padding_overflow() {
        assert_eq!(padded_len(usize::MAX), None);
        assert_eq!(padded_len(usize::MAX - GUARD_LEN), Some(usize::MAX));
    }
}
