//! Payload masking (RFC 6455 Section 5.3).

use crate::error::{Error, Result};

/// XOR `data` with `mask`, starting at mask position 0.
#[inline]
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    apply_mask_at(data, mask, 0);
}

/// XOR `data` with `mask`, treating `data[0]` as payload byte number `offset`.
///
/// The decoder unmasks payload chunks as they arrive, so a chunk may begin in
/// the middle of a mask cycle.
#[inline]
pub fn apply_mask_at(data: &mut [u8], mask: [u8; 4], offset: usize) {
    let shift = offset % 4;
    let rotated = [
        mask[shift],
        mask[(shift + 1) % 4],
        mask[(shift + 2) % 4],
        mask[(shift + 3) % 4],
    ];
    apply_mask_fast(data, rotated);
}

/// Word-at-a-time variant of [`apply_mask`].
#[inline]
pub fn apply_mask_fast(data: &mut [u8], mask: [u8; 4]) {
    let mask_u32 = u32::from_ne_bytes(mask);
    let mut chunks = data.chunks_exact_mut(4);
    for chunk in &mut chunks {
        let word = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) ^ mask_u32;
        chunk.copy_from_slice(&word.to_ne_bytes());
    }
    for (byte, key) in chunks.into_remainder().iter_mut().zip(mask) {
        *byte ^= key;
    }
}

/// Draw a fresh masking key from the operating system RNG.
///
/// # Errors
///
/// Returns [`Error::Io`] if the system RNG is unavailable.
pub fn random_mask_key() -> Result<[u8; 4]> {
    let mut key = [0u8; 4];
    getrandom::getrandom(&mut key).map_err(|e| Error::Io(format!("rng unavailable: {e}")))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    #[test]
    fn test_mask_rfc_example() {
        let mut data = *b"Hello";
        apply_mask(&mut data, MASK);
        assert_eq!(data, [0x7f, 0x9f, 0x4d, 0x51, 0x58]);
    }

    #[test]
    fn test_mask_is_involution() {
        let original: Vec<u8> = (0..=255).collect();
        let mut data = original.clone();
        apply_mask(&mut data, MASK);
        assert_ne!(data, original);
        apply_mask(&mut data, MASK);
        assert_eq!(data, original);
    }

    #[test]
    fn test_fast_matches_scalar() {
        for len in 0..40 {
            let mut fast: Vec<u8> = (0..len as u8).collect();
            let mut scalar = fast.clone();
            apply_mask_fast(&mut fast, MASK);
            for (i, b) in scalar.iter_mut().enumerate() {
                *b ^= MASK[i % 4];
            }
            assert_eq!(fast, scalar, "len {len}");
        }
    }

    #[test]
    fn test_mask_at_offset_matches_whole() {
        let payload: Vec<u8> = (0..23).collect();
        let mut whole = payload.clone();
        apply_mask(&mut whole, MASK);

        for split in 0..payload.len() {
            let mut pieces = payload.clone();
            let (head, tail) = pieces.split_at_mut(split);
            apply_mask_at(head, MASK, 0);
            apply_mask_at(tail, MASK, split);
            assert_eq!(pieces, whole, "split at {split}");
        }
    }

    #[test]
    fn test_empty_data() {
        let mut data: [u8; 0] = [];
        apply_mask(&mut data, MASK);
        apply_mask_at(&mut data, MASK, 3);
    }

    #[test]
    fn test_random_mask_keys_vary() {
        let keys: Vec<[u8; 4]> = (0..8).map(|_| random_mask_key().unwrap()).collect();
        assert!(keys.windows(2).any(|w| w[0] != w[1]));
    }
}
