//! Low-level cryptographic operations.
//!
//! Together with `keys`, this is the only module that imports `ring`. Every
//! other module encrypts, signs and hashes exclusively through the functions
//! here.
//!
//! Primitive choices:
//! - **Cipher**: AES-256-GCM, 96-bit IV drawn fresh per call, 128-bit tag
//! - **KDF**: PBKDF2-HMAC-SHA256
//! - **MAC**: HMAC-SHA256, verified in constant time
//! - **Randomness**: `ring::rand::SystemRandom`, the single source in the crate

use std::num::NonZeroU32;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use ring::{digest, hmac, pbkdf2};

use crate::error::CryptoError;

/// The AEAD algorithm used throughout sealwire.
const ALGORITHM: &aead::Algorithm = &AES_256_GCM;

/// Size of the AEAD IV in bytes (96 bits).
pub const IV_LEN: usize = 12;

/// Size of the GCM authentication tag in bytes (128 bits).
pub const TAG_LEN: usize = 16;

/// Size of every symmetric key in bytes (256 bits).
pub const KEY_LEN: usize = 32;

/// Size of KDF salts in bytes (128 bits).
pub const SALT_LEN: usize = 16;

/// Output of a detached-tag AEAD seal.
pub struct Sealed {
    pub iv: [u8; IV_LEN],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

/// Fill a fixed-size buffer from the system RNG.
pub fn random_array<const N: usize>() -> Result<[u8; N], CryptoError> {
    let mut buf = [0u8; N];
    SystemRandom::new()
        .fill(&mut buf)
        .map_err(|_| CryptoError::RandomnessFailure)?;
    Ok(buf)
}

/// Random URL-safe token carrying `N` bytes of entropy.
pub fn random_token<const N: usize>() -> Result<String, CryptoError> {
    let bytes = random_array::<N>()?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

fn aead_key(key_bytes: &[u8; KEY_LEN]) -> Result<LessSafeKey, CryptoError> {
    let unbound = UnboundKey::new(ALGORITHM, key_bytes).map_err(|_| CryptoError::InvalidKey)?;
    Ok(LessSafeKey::new(unbound))
}

/// Encrypt with AES-256-GCM, returning IV, ciphertext and tag separately.
///
/// `aad` is authenticated but not encrypted.
pub fn seal_detached(
    key_bytes: &[u8; KEY_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Sealed, CryptoError> {
    let key = aead_key(key_bytes)?;
    let iv = random_array::<IV_LEN>()?;

    let mut ciphertext = plaintext.to_vec();
    let tag = key
        .seal_in_place_separate_tag(
            Nonce::assume_unique_for_key(iv),
            Aad::from(aad),
            &mut ciphertext,
        )
        .map_err(|_| CryptoError::EncryptionFailure)?;

    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(tag.as_ref());

    Ok(Sealed {
        iv,
        ciphertext,
        tag: tag_bytes,
    })
}

/// Decrypt an AES-256-GCM ciphertext whose tag travels separately.
///
/// Returns `None` on any authentication failure. The caller receives no
/// partial plaintext and no hint as to why the check failed.
pub fn open_detached(
    key_bytes: &[u8; KEY_LEN],
    aad: &[u8],
    iv: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
) -> Option<Vec<u8>> {
    let iv: [u8; IV_LEN] = iv.try_into().ok()?;
    if tag.len() != TAG_LEN {
        return None;
    }
    let key = aead_key(key_bytes).ok()?;

    let mut in_out = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    in_out.extend_from_slice(ciphertext);
    in_out.extend_from_slice(tag);

    let plaintext = key
        .open_in_place(Nonce::assume_unique_for_key(iv), Aad::from(aad), &mut in_out)
        .ok()?;
    Some(plaintext.to_vec())
}

/// Derive a 256-bit key with PBKDF2-HMAC-SHA256.
pub fn pbkdf2_sha256(
    secret: &[u8],
    salt: &[u8],
    iterations: NonZeroU32,
) -> [u8; KEY_LEN] {
    let mut out = [0u8; KEY_LEN];
    pbkdf2::derive(pbkdf2::PBKDF2_HMAC_SHA256, iterations, salt, secret, &mut out);
    out
}

/// SHA-256 over the concatenation of `parts`.
pub fn sha256(parts: &[&[u8]]) -> [u8; KEY_LEN] {
    let mut ctx = digest::Context::new(&digest::SHA256);
    for part in parts {
        ctx.update(part);
    }
    let mut out = [0u8; KEY_LEN];
    out.copy_from_slice(ctx.finish().as_ref());
    out
}

/// HMAC-SHA256 signature, hex encoded.
pub fn hmac_sha256_hex(key_bytes: &[u8], data: &[u8]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key_bytes);
    hex::encode(hmac::sign(&key, data).as_ref())
}

/// Constant-time verification of a hex-encoded HMAC-SHA256 signature.
pub fn hmac_sha256_verify(key_bytes: &[u8], data: &[u8], signature: &[u8]) -> bool {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key_bytes);
    hmac::verify(&key, data, signature).is_ok()
}
