//! Session keys: X25519 agreement, HKDF-SHA256 derivation and AES-256-CBC
//!
//! Each call generates a fresh ephemeral key pair. The 32-byte public key does
//! not fit one telegram, so it travels as two fragments (KEY_START, KEY_END).
//! The shared secret is expanded with HKDF into the cipher key, and the first
//! three bytes of the same output form the session code both users compare
//! over the voice channel.
//!
//! The CBC initialization vector is a fixed value shared by every session.
//! Only the per-session key keeps ciphertexts of equal plaintexts apart
//! across sessions; changing the IV breaks compatibility with existing peers.

use crate::error::{LinkError, Result};
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const SESSION_IV: [u8; 16] = *b"1234567890123456";
pub const KDF_INFO: &[u8] = b"out-band-verification";
pub const PUBLIC_KEY_LEN: usize = 32;

/// Our half of the key agreement, consumed once the peer key is complete
pub struct LocalKey {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl LocalKey {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.public.to_bytes()
    }

    /// KEY_START and KEY_END payloads for a telegram carrying at most
    /// `max_len` data bytes
    pub fn fragments(&self, max_len: usize) -> (Vec<u8>, Vec<u8>) {
        let bytes = self.public_bytes();
        let split = max_len.min(PUBLIC_KEY_LEN);
        (bytes[..split].to_vec(), bytes[split..].to_vec())
    }

    pub fn agree(self, peer_public: &[u8]) -> Result<SessionKeys> {
        let peer: [u8; PUBLIC_KEY_LEN] = peer_public.try_into().map_err(|_| {
            LinkError::Crypto(format!(
                "peer public key has {} bytes, expected {}",
                peer_public.len(),
                PUBLIC_KEY_LEN
            ))
        })?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(peer));
        if !shared.was_contributory() {
            return Err(LinkError::Crypto("peer public key is a low-order point".into()));
        }
        SessionKeys::derive(shared.as_bytes())
    }
}

/// Material derived from one key agreement
pub struct SessionKeys {
    pub cipher: SessionCipher,
    /// Value compared out-of-band by both users
    pub code: u32,
}

impl SessionKeys {
    pub fn derive(shared_secret: &[u8]) -> Result<Self> {
        let hk = Hkdf::<Sha256>::new(None, shared_secret);
        let mut okm = [0u8; 32];
        hk.expand(KDF_INFO, &mut okm)
            .map_err(|e| LinkError::Crypto(format!("HKDF expand failed: {}", e)))?;
        let code = okm[0] as u32 + 16 * okm[1] as u32 + 32 * okm[2] as u32;
        Ok(Self {
            cipher: SessionCipher::new(okm),
            code,
        })
    }
}

#[derive(Clone)]
pub struct SessionCipher {
    key: [u8; 32],
}

impl SessionCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        Aes256CbcEnc::new(&self.key.into(), &SESSION_IV.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        Aes256CbcDec::new(&self.key.into(), &SESSION_IV.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|e| LinkError::Crypto(format!("decryption failed: {}", e)))
    }

    /// Decrypt and decode as UTF-8
    pub fn decrypt_text(&self, ciphertext: &[u8]) -> Result<String> {
        let plain = self.decrypt(ciphertext)?;
        String::from_utf8(plain).map_err(|e| LinkError::InvalidPayload(e.to_string()))
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionCipher { .. }")
    }
}
