//! FNV-1a hashing used to map cache ids to table buckets.
//!
//! The reference implementation this cache is modeled on special-cases
//! 1/2/4/8-byte ids with an unrolled form and falls back to a byte loop for
//! anything else. Every id in this crate is a 32- or 64-bit integer, so the
//! unrolled paths below cover the only cases actually hit; the byte-loop
//! fallback exists for completeness and any future wider id.

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

fn fnv1a_step(hash: u64, byte: u8) -> u64 {
    (hash ^ byte as u64).wrapping_mul(FNV_PRIME)
}

/// FNV-1a over the little-endian bytes of an id, dispatching to an
/// unrolled form for the widths actually used (4 and 8 bytes).
pub fn fnv1a_hash(bytes: &[u8]) -> u64 {
    match bytes.len() {
        4 => fnv1a32(bytes),
        8 => fnv1a64(bytes),
        _ => fnv1a_bytes(bytes),
    }
}

fn fnv1a32(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    hash = fnv1a_step(hash, bytes[0]);
    hash = fnv1a_step(hash, bytes[1]);
    hash = fnv1a_step(hash, bytes[2]);
    fnv1a_step(hash, bytes[3])
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in bytes.iter().take(8) {
        hash = fnv1a_step(hash, byte);
    }
    hash
}

fn fnv1a_bytes(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in bytes {
        hash = fnv1a_step(hash, byte);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrolled_and_byte_loop_forms_agree() {
        let bytes = 0xDEADBEEFu32.to_le_bytes();
        assert_eq!(fnv1a32(&bytes), fnv1a_bytes(&bytes));
    }

    #[test]
    fn hash_is_deterministic() {
        let bytes = 42u32.to_le_bytes();
        assert_eq!(fnv1a_hash(&bytes), fnv1a_hash(&bytes));
    }
}
