//! Cryptographic primitives shared by the secure cache and the IPC bus
//!
//! Key material is derived once per process via scrypt and held behind
//! `secrecy`; sealing uses AES-256-GCM with domain-separated AADs so a blob
//! sealed for one subsystem can never be opened by another.

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use scrypt::{scrypt, Params as ScryptParams};
use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;
use thiserror::Error;

/// AAD for IPC message payloads
pub const AAD_IPC: &[u8] = b"ipc-message";
/// AAD for secure cache entries
pub const AAD_CACHE: &[u8] = b"cache-entry";

const KEY_LEN: usize = 32;
const TAG_LEN: usize = 16;

/// Crypto-specific errors
#[derive(Error, Debug)]
pub enum CryptoError {
    /// scrypt parameterisation or derivation failed
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    /// AEAD seal failed
    #[error("Encryption failed: {0}")]
    Seal(String),

    /// AEAD open failed (wrong key, wrong AAD, or tampered ciphertext)
    #[error("Integrity check failed")]
    Open,

    /// Hex field could not be decoded
    #[error("Invalid hex encoding: {0}")]
    Encoding(String),

    /// Nonce or tag had the wrong length
    #[error("Invalid length for {0}")]
    InvalidLength(&'static str),
}

pub type CryptoResult<T> = std::result::Result<T, CryptoError>;

/// A sealed blob as carried on the wire: ciphertext, nonce, and auth tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedPayload {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
    pub tag: [u8; TAG_LEN],
}

impl SealedPayload {
    /// Rebuild from the hex triple used in wire formats.
    pub fn from_hex(ciphertext: &str, nonce: &str, tag: &str) -> CryptoResult<Self> {
        let ciphertext =
            hex::decode(ciphertext).map_err(|e| CryptoError::Encoding(e.to_string()))?;
        let nonce_bytes = hex::decode(nonce).map_err(|e| CryptoError::Encoding(e.to_string()))?;
        let tag_bytes = hex::decode(tag).map_err(|e| CryptoError::Encoding(e.to_string()))?;

        let nonce: [u8; NONCE_LEN] = nonce_bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidLength("nonce"))?;
        let tag: [u8; TAG_LEN] = tag_bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidLength("auth tag"))?;

        Ok(Self {
            ciphertext,
            nonce,
            tag,
        })
    }
}

/// Derived symmetric keys for one cluster secret.
///
/// Holds the raw AES key and the HMAC signing key; AEAD keys are rebuilt per
/// operation because ring's sealing keys are single-use values.
pub struct CipherSuite {
    aes_key: [u8; KEY_LEN],
    hmac_key: hmac::Key,
    rng: SystemRandom,
}

impl std::fmt::Debug for CipherSuite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherSuite").finish_non_exhaustive()
    }
}

impl CipherSuite {
    /// Derive the suite from a shared secret.
    ///
    /// scrypt N=16384, r=8, p=1 with the fixed literal salt the wire format
    /// was defined against; both sides must derive identically.
    pub fn derive(secret: &SecretString) -> CryptoResult<Self> {
        let params = ScryptParams::new(14, 8, 1, KEY_LEN)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

        let mut aes_key = [0u8; KEY_LEN];
        scrypt(
            secret.expose_secret().as_bytes(),
            b"salt",
            &params,
            &mut aes_key,
        )
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

        let hmac_key = hmac::Key::new(hmac::HMAC_SHA256, secret.expose_secret().as_bytes());

        Ok(Self {
            aes_key,
            hmac_key,
            rng: SystemRandom::new(),
        })
    }

    /// Generate a fresh random cluster secret, hex encoded.
    pub fn generate_secret() -> CryptoResult<String> {
        let rng = SystemRandom::new();
        let mut bytes = [0u8; KEY_LEN];
        rng.fill(&mut bytes)
            .map_err(|_| CryptoError::KeyDerivation("system rng unavailable".to_string()))?;
        Ok(hex::encode(bytes))
    }

    /// AES-256-GCM seal with the given AAD and a fresh random nonce.
    pub fn seal(&self, aad: &'static [u8], plaintext: &[u8]) -> CryptoResult<SealedPayload> {
        let unbound = UnboundKey::new(&AES_256_GCM, &self.aes_key)
            .map_err(|_| CryptoError::Seal("bad key length".to_string()))?;
        let key = LessSafeKey::new(unbound);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| CryptoError::Seal("system rng unavailable".to_string()))?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = plaintext.to_vec();
        let tag = key
            .seal_in_place_separate_tag(nonce, Aad::from(aad), &mut in_out)
            .map_err(|_| CryptoError::Seal("aead seal failed".to_string()))?;

        let tag: [u8; TAG_LEN] = tag
            .as_ref()
            .try_into()
            .map_err(|_| CryptoError::InvalidLength("auth tag"))?;

        Ok(SealedPayload {
            ciphertext: in_out,
            nonce: nonce_bytes,
            tag,
        })
    }

    /// AES-256-GCM open; any tampering of ciphertext, nonce, tag, or AAD
    /// domain yields `CryptoError::Open` with no detail.
    pub fn open(&self, aad: &'static [u8], sealed: &SealedPayload) -> CryptoResult<Vec<u8>> {
        let unbound = UnboundKey::new(&AES_256_GCM, &self.aes_key)
            .map_err(|_| CryptoError::Seal("bad key length".to_string()))?;
        let key = LessSafeKey::new(unbound);
        let nonce = Nonce::assume_unique_for_key(sealed.nonce);

        let mut in_out = Vec::with_capacity(sealed.ciphertext.len() + TAG_LEN);
        in_out.extend_from_slice(&sealed.ciphertext);
        in_out.extend_from_slice(&sealed.tag);

        let plaintext = key
            .open_in_place(nonce, Aad::from(aad), &mut in_out)
            .map_err(|_| CryptoError::Open)?;

        Ok(plaintext.to_vec())
    }

    /// HMAC-SHA-256 signature, hex encoded.
    pub fn sign(&self, message: &[u8]) -> String {
        hex::encode(hmac::sign(&self.hmac_key, message).as_ref())
    }

    /// Constant-time signature verification of a hex signature.
    pub fn verify(&self, message: &[u8], signature_hex: &str) -> bool {
        let Ok(signature) = hex::decode(signature_hex) else {
            return false;
        };
        let expected = hmac::sign(&self.hmac_key, message);
        expected.as_ref().ct_eq(&signature).into()
    }
}
