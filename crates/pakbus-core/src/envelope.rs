//! The encrypted-payload envelope wrapped around a BMP5 message's body
//! before it goes out the wire (spec.md §4.4).
//!
//! Layout: `cipher_code (1) ∥ nonce_len (1) ∥ nonce ∥ plaintext_len (2, BE)
//! ∥ ciphertext`. The plaintext length lets the receiver discard the
//! zero-padding `AesCipher::encrypt` added to reach a block boundary.

use crate::cipher::{AesCipher, CIPHER_CODE_AES, CipherError};

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("PakBus framing error: {0}")]
    Framing(&'static str),

    #[error("payload of {len} bytes exceeds the {max}-byte limit")]
    PlaintextTooLarge { len: usize, max: usize },

    #[error(transparent)]
    Cipher(#[from] CipherError),
}

pub type Result<T> = std::result::Result<T, EnvelopeError>;

/// Encrypt `plaintext` under `cipher` (after setting its IV from `nonce`)
/// and frame it with the header `decode` expects.
pub fn encode(cipher: &mut AesCipher, nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    if nonce.len() > u8::MAX as usize {
        return Err(EnvelopeError::Framing("nonce longer than 255 bytes"));
    }
    if plaintext.len() > u16::MAX as usize {
        return Err(EnvelopeError::PlaintextTooLarge {
            len: plaintext.len(),
            max: u16::MAX as usize,
        });
    }
    cipher.set_initialisation_vector(nonce);
    let ciphertext = cipher.encrypt(plaintext);

    let mut out = Vec::with_capacity(4 + nonce.len() + ciphertext.len());
    out.push(CIPHER_CODE_AES);
    out.push(nonce.len() as u8);
    out.extend_from_slice(nonce);
    out.extend_from_slice(&(plaintext.len() as u16).to_be_bytes());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Parse the envelope header from `framed`, decrypt with `cipher` (IV
/// taken from the embedded nonce), and return the original plaintext.
pub fn decode(cipher: &mut AesCipher, framed: &[u8]) -> Result<Vec<u8>> {
    let &[cipher_code, nonce_len, ref rest @ ..] = framed else {
        return Err(EnvelopeError::Framing("encrypted envelope shorter than its header"));
    };
    if cipher_code != CIPHER_CODE_AES {
        return Err(EnvelopeError::Framing("unsupported cipher code"));
    }
    let nonce_len = nonce_len as usize;
    if rest.len() < nonce_len + 2 {
        return Err(EnvelopeError::Framing("encrypted envelope shorter than its header"));
    }
    let nonce = &rest[..nonce_len];
    let plaintext_len = u16::from_be_bytes([rest[nonce_len], rest[nonce_len + 1]]) as usize;
    let ciphertext = &rest[nonce_len + 2..];

    cipher.set_initialisation_vector(nonce);
    Ok(cipher.decrypt_to_len(ciphertext, plaintext_len)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encode_decode() {
        let mut cipher = AesCipher::new("shared secret");
        let plaintext = b"a BMP5 message body, header and all";
        let framed = encode(&mut cipher, b"nonce-123", plaintext).unwrap();

        let mut receiver = AesCipher::new("shared secret");
        let recovered = decode(&mut receiver, &framed).unwrap();
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn truncated_envelope_is_rejected() {
        let mut cipher = AesCipher::new("secret");
        let err = decode(&mut cipher, &[CIPHER_CODE_AES, 5, 1, 2]).unwrap_err();
        assert!(matches!(err, EnvelopeError::Framing(_)));
    }

    #[test]
    fn wrong_cipher_code_is_rejected() {
        let mut cipher = AesCipher::new("secret");
        let err = decode(&mut cipher, &[0xEE, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, EnvelopeError::Framing(_)));
    }
}
