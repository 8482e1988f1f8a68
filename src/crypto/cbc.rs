//! AES-256-CBC with PKCS7 padding, used to encrypt customer secrets at
//! rest. Storage format is `IV(16 bytes) || ciphertext`, matching the
//! column layout documented in `SPEC_FULL.md` §6.

use aes::Aes256;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroize;

type Encryptor = cbc::Encryptor<Aes256>;
type Decryptor = cbc::Decryptor<Aes256>;

const KEY_SIZE: usize = 32;
const IV_SIZE: usize = 16;

/// Errors raised by the AES-CBC wrapper.
#[derive(Error, Debug)]
pub enum CbcError {
    /// The supplied key was not exactly 32 bytes.
    #[error("invalid key size: expected {KEY_SIZE} bytes")]
    InvalidKeySize,

    /// A stored blob was too short to contain an IV.
    #[error("invalid ciphertext: missing or truncated IV")]
    InvalidCiphertext,

    /// Padding or block-alignment failure while decrypting.
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
}

/// Result type for this module.
pub type CbcResult<T> = Result<T, CbcError>;

/// A 32-byte AES-256 key, zeroized on drop.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct EncryptionKey([u8; KEY_SIZE]);

impl EncryptionKey {
    /// Build a key from exactly 32 raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> CbcResult<Self> {
        let array: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| CbcError::InvalidKeySize)?;
        Ok(Self(array))
    }
}

/// Ciphertext as stored on disk: `IV || AES-CBC(key, iv, plaintext)`.
///
/// The plaintext is zeroized on drop once decrypted; the ciphertext blob
/// itself carries no secret material once sealed, so it is not zeroized.
pub struct EncryptedSecret {
    blob: Vec<u8>,
}

impl EncryptedSecret {
    /// Encrypt `plaintext` under `key` with a freshly generated random IV.
    pub fn seal(key: &EncryptionKey, plaintext: &[u8]) -> Self {
        let mut iv = [0u8; IV_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut iv);

        let ciphertext = Encryptor::new(&key.0.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut blob = Vec::with_capacity(IV_SIZE + ciphertext.len());
        blob.extend_from_slice(&iv);
        blob.extend_from_slice(&ciphertext);

        Self { blob }
    }

    /// Wrap an already-sealed blob as read from storage.
    pub fn from_stored_blob(blob: Vec<u8>) -> Self {
        Self { blob }
    }

    /// The raw `IV || ciphertext` bytes, as written to the `secret` column.
    pub fn as_blob(&self) -> &[u8] {
        &self.blob
    }

    /// Split off the IV and decrypt the remainder under `key`.
    pub fn open(&self, key: &EncryptionKey) -> CbcResult<Vec<u8>> {
        if self.blob.len() < IV_SIZE {
            return Err(CbcError::InvalidCiphertext);
        }
        let (iv, ciphertext) = self.blob.split_at(IV_SIZE);

        let mut buffer = ciphertext.to_vec();
        let plaintext = Decryptor::new(&key.0.into(), iv.into())
            .decrypt_padded_mut::<Pkcs7>(&mut buffer)
            .map_err(|e| CbcError::DecryptionFailed(e.to_string()))?;

        Ok(plaintext.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> EncryptionKey {
        EncryptionKey::from_bytes(&[7u8; KEY_SIZE]).unwrap()
    }

    #[test]
    fn round_trips_plaintext() {
        let key = test_key();
        let plaintext = vec![1u8; 64];
        let sealed = EncryptedSecret::seal(&key, &plaintext);
        assert_eq!(sealed.open(&key).unwrap(), plaintext);
    }

    #[test]
    fn blob_length_is_iv_plus_ciphertext_and_iv_varies() {
        let key = test_key();
        let plaintext = vec![9u8; 64];
        let a = EncryptedSecret::seal(&key, &plaintext);
        let b = EncryptedSecret::seal(&key, &plaintext);
        assert_eq!(a.as_blob().len(), IV_SIZE + 64 + 16); // one pkcs7 pad block
        assert_ne!(&a.as_blob()[..IV_SIZE], &b.as_blob()[..IV_SIZE]);
    }

    #[test]
    fn rejects_truncated_blob() {
        let key = test_key();
        let sealed = EncryptedSecret::from_stored_blob(vec![0u8; 4]);
        assert!(matches!(sealed.open(&key), Err(CbcError::InvalidCiphertext)));
    }
}
