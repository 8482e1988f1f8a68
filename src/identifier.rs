//! Reversible customer-identifier codec (C2).
//!
//! A `CustomerId` is a non-zero `u32`. The identifier exchanged with
//! clients is the encryption of the 64-bit block `(customer_id, 0)` under
//! a process-wide 128-bit key, using an XTEA-family 64-round Feistel
//! cipher. Decrypting any identifier yields a 64-bit value; if its high 32
//! bits are non-zero the identifier is rejected (the only validity check).
//!
//! The exact round schedule of the block cipher this replaces was not
//! available in the source this was ported from (it lives in a separate,
//! unretrieved library). This uses the canonical XTEA constant schedule,
//! which preserves the cipher family, block size, key size and round count
//! the format calls for; see `DESIGN.md` for the tradeoff this implies.

use zeroize::Zeroize;

const XTEA_DELTA: u32 = 0x9E37_79B9;
const XTEA_ROUNDS: u32 = 32; // 32 Feistel cycles == 64 round-function applications

/// 128-bit key for the identifier codec.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct IdentifierKey([u32; 4]);

impl IdentifierKey {
    /// Build a key from 16 raw bytes (big key schedule words, little-endian).
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        let mut words = [0u32; 4];
        for (i, word) in words.iter_mut().enumerate() {
            *word = u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
        }
        Self(words)
    }
}

fn encrypt_block(mut v0: u32, mut v1: u32, key: &IdentifierKey) -> (u32, u32) {
    let mut sum: u32 = 0;
    for _ in 0..XTEA_ROUNDS {
        v0 = v0.wrapping_add(
            (((v1 << 4) ^ (v1 >> 5)).wrapping_add(v1))
                ^ (sum.wrapping_add(key.0[(sum & 3) as usize])),
        );
        sum = sum.wrapping_add(XTEA_DELTA);
        v1 = v1.wrapping_add(
            (((v0 << 4) ^ (v0 >> 5)).wrapping_add(v0))
                ^ (sum.wrapping_add(key.0[((sum >> 11) & 3) as usize])),
        );
    }
    (v0, v1)
}

fn decrypt_block(mut v0: u32, mut v1: u32, key: &IdentifierKey) -> (u32, u32) {
    let mut sum: u32 = XTEA_DELTA.wrapping_mul(XTEA_ROUNDS);
    for _ in 0..XTEA_ROUNDS {
        v1 = v1.wrapping_sub(
            (((v0 << 4) ^ (v0 >> 5)).wrapping_add(v0))
                ^ (sum.wrapping_add(key.0[((sum >> 11) & 3) as usize])),
        );
        sum = sum.wrapping_sub(XTEA_DELTA);
        v0 = v0.wrapping_sub(
            (((v1 << 4) ^ (v1 >> 5)).wrapping_add(v1))
                ^ (sum.wrapping_add(key.0[(sum & 3) as usize])),
        );
    }
    (v0, v1)
}

/// Encrypt a `CustomerId` into the opaque 64-bit identifier exchanged with
/// clients. The plaintext block is `(customer_id, 0)`.
pub fn to_identifier(customer_id: u32, key: &IdentifierKey) -> u64 {
    let (v0, v1) = encrypt_block(customer_id, 0, key);
    ((v1 as u64) << 32) | v0 as u64
}

/// Decrypt an opaque identifier back into a `CustomerId`. Returns `0`
/// (invalid) unless the high 32 bits of the decrypted block are zero.
pub fn to_customer_id(identifier: u64, key: &IdentifierKey) -> u32 {
    let v0 = (identifier & 0xFFFF_FFFF) as u32;
    let v1 = (identifier >> 32) as u32;
    let (plain_low, plain_high) = decrypt_block(v0, v1, key);
    if plain_high != 0 {
        0
    } else {
        plain_low
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> IdentifierKey {
        IdentifierKey::from_bytes(*b"0123456789ABCDEF")
    }

    #[test]
    fn round_trips_for_representative_ids() {
        let key = test_key();
        for id in [1u32, 2, (1u32 << 31), u32::MAX] {
            let identifier = to_identifier(id, &key);
            assert_eq!(to_customer_id(identifier, &key), id);
        }
    }

    #[test]
    fn different_keys_produce_different_identifiers() {
        let a = IdentifierKey::from_bytes(*b"0123456789ABCDEF");
        let b = IdentifierKey::from_bytes(*b"FEDCBA9876543210");
        assert_ne!(to_identifier(42, &a), to_identifier(42, &b));
    }

    #[test]
    fn zero_is_a_valid_plaintext_customer_id_round_trip() {
        // customer id 0 is "invalid" by data-model convention, but the
        // codec itself is a pure bijection and must round-trip it too.
        let key = test_key();
        let identifier = to_identifier(0, &key);
        assert_eq!(to_customer_id(identifier, &key), 0);
    }

    proptest::proptest! {
        #[test]
        fn to_identifier_and_to_customer_id_are_inverses(id: u32) {
            let key = test_key();
            let identifier = to_identifier(id, &key);
            proptest::prop_assert_eq!(to_customer_id(identifier, &key), id);
        }
    }
}
