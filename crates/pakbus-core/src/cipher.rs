//! AES-128-CBC payload cipher, keyed from MD5(secret) with a per-session
//! IV derived from MD5(nonce) (spec.md §4.4, §6).

use aes::Aes128;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use md5::{Digest, Md5};

type Encryptor = cbc::Encryptor<Aes128>;
type Decryptor = cbc::Decryptor<Aes128>;

/// Cipher code carried in the encrypted PakCtrl envelope (spec.md §6).
pub const CIPHER_CODE_AES: u8 = 1;

const BLOCK_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("decryption failure: {0}")]
    DecryptionFailure(&'static str),
}

pub type Result<T> = std::result::Result<T, CipherError>;

fn md5(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn padded_len(len: usize) -> usize {
    len.div_ceil(BLOCK_LEN) * BLOCK_LEN
}

/// A per-session AES-128-CBC context: key from the shared secret, IV set
/// separately per message via [`set_initialisation_vector`](Self::set_initialisation_vector).
#[derive(Clone)]
pub struct AesCipher {
    key: [u8; 16],
    iv: [u8; 16],
}

impl AesCipher {
    /// `key = MD5(shared_secret)`. The IV starts as all zero bytes until
    /// [`set_initialisation_vector`](Self::set_initialisation_vector) is called.
    pub fn new(shared_secret: &str) -> Self {
        AesCipher {
            key: md5(shared_secret.as_bytes()),
            iv: [0u8; 16],
        }
    }

    /// `iv = MD5(nonce)`. The nonce is opaque bytes; its only contract is
    /// that both peers hash it the same way (spec.md §9 open question).
    pub fn set_initialisation_vector(&mut self, nonce: &[u8]) {
        self.iv = md5(nonce);
    }

    /// Zero-pad `plaintext` to a multiple of 16 bytes and encrypt in
    /// place, returning the ciphertext (same length as the padded
    /// plaintext).
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut buf = plaintext.to_vec();
        buf.resize(padded_len(plaintext.len()), 0);
        let encryptor = Encryptor::new(&self.key.into(), &self.iv.into());
        let len = buf.len();
        encryptor
            .encrypt_padded_mut::<NoPadding>(&mut buf, len)
            .expect("buffer is already block-aligned");
        buf
    }

    /// Decrypt `ciphertext`, which must be a multiple of 16 bytes.
    /// Callers truncate the result to the declared plaintext length
    /// themselves (spec.md §4.4: "the payload length carried in the
    /// wrapping PakCtrl message tells the receiver how much plaintext to
    /// keep").
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() % BLOCK_LEN != 0 {
            return Err(CipherError::DecryptionFailure("ciphertext length not a multiple of 16"));
        }
        let mut buf = ciphertext.to_vec();
        let decryptor = Decryptor::new(&self.key.into(), &self.iv.into());
        decryptor
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .map_err(|_| CipherError::DecryptionFailure("block decrypt failed"))?;
        Ok(buf)
    }

    /// Decrypt then truncate to `plaintext_len`, failing if the declared
    /// length exceeds the decrypted buffer (spec.md §7 `DecryptionFailure`).
    pub fn decrypt_to_len(&self, ciphertext: &[u8], plaintext_len: usize) -> Result<Vec<u8>> {
        let mut decrypted = self.decrypt(ciphertext)?;
        if plaintext_len > decrypted.len() {
            return Err(CipherError::DecryptionFailure(
                "declared plaintext length exceeds decrypted buffer",
            ));
        }
        decrypted.truncate(plaintext_len);
        Ok(decrypted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s6_encrypted_bmp5_round_trip() {
        let mut cipher = AesCipher::new("hello");
        cipher.set_initialisation_vector(b"nonce-1");

        let plaintext = vec![0x42u8; 40];
        let ciphertext = cipher.encrypt(&plaintext);
        assert_eq!(ciphertext.len(), 48);

        let decrypted = cipher.decrypt_to_len(&ciphertext, plaintext.len()).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn cipher_round_trip_property() {
        for len in [0usize, 1, 15, 16, 17, 1000 - 16 - 3] {
            let mut cipher = AesCipher::new("a shared secret");
            cipher.set_initialisation_vector(b"some-nonce");
            let plaintext: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
            let ciphertext = cipher.encrypt(&plaintext);
            assert_eq!(ciphertext.len() % 16, 0);
            let decrypted = cipher.decrypt_to_len(&ciphertext, plaintext.len()).unwrap();
            assert_eq!(decrypted, plaintext);
        }
    }

    #[test]
    fn non_block_aligned_ciphertext_is_rejected() {
        let cipher = AesCipher::new("secret");
        let err = cipher.decrypt(&[0u8; 17]).unwrap_err();
        assert!(matches!(err, CipherError::DecryptionFailure(_)));
    }

    #[test]
    fn declared_length_past_buffer_is_rejected() {
        let mut cipher = AesCipher::new("secret");
        cipher.set_initialisation_vector(b"nonce");
        let ciphertext = cipher.encrypt(&[1, 2, 3]);
        let err = cipher.decrypt_to_len(&ciphertext, 100).unwrap_err();
        assert!(matches!(err, CipherError::DecryptionFailure(_)));
    }
}
