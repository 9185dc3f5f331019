//! Password envelope encryption.
//!
//! Format: `salt_hex-iv_hex-ciphertext_hex`. The key is derived with
//! PBKDF2-HMAC-SHA256 (1,000 rounds, 8-byte salt, 32-byte key) and the
//! payload sealed with AES-256-GCM under a random 12-byte nonce, no AAD.
//! Config entries with `password_type: aes-gcm-256` carry this format.

use anyhow::{anyhow, bail, Context, Result};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use std::num::NonZeroU32;

const PBKDF2_ROUNDS: u32 = 1000;
const SALT_LEN: usize = 8;
const KEY_LEN: usize = 32;

fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        NonZeroU32::new(PBKDF2_ROUNDS).expect("non-zero round count"),
        salt,
        passphrase.as_bytes(),
        &mut key,
    );
    key
}

fn sealing_key(passphrase: &str, salt: &[u8]) -> Result<LessSafeKey> {
    let key = derive_key(passphrase, salt);
    let unbound =
        UnboundKey::new(&AES_256_GCM, &key).map_err(|_| anyhow!("invalid AES-256-GCM key"))?;
    Ok(LessSafeKey::new(unbound))
}

/// Encrypt a plaintext password under a passphrase-derived key.
pub fn encrypt_password(passphrase: &str, plaintext: &str) -> Result<String> {
    let rng = SystemRandom::new();
    let mut salt = [0u8; SALT_LEN];
    rng.fill(&mut salt)
        .map_err(|_| anyhow!("failed to generate salt"))?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rng.fill(&mut nonce_bytes)
        .map_err(|_| anyhow!("failed to generate nonce"))?;

    let key = sealing_key(passphrase, &salt)?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let mut in_out = plaintext.as_bytes().to_vec();
    key.seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| anyhow!("encryption failed"))?;

    Ok(format!(
        "{}-{}-{}",
        hex::encode(salt),
        hex::encode(nonce_bytes),
        hex::encode(&in_out)
    ))
}

/// Decrypt a `salt-iv-ciphertext` envelope produced by
/// [`encrypt_password`].
pub fn decrypt_password(passphrase: &str, envelope: &str) -> Result<String> {
    let parts: Vec<&str> = envelope.split('-').collect();
    if parts.len() != 3 {
        bail!("envelope must consist of salt-iv-ciphertext, got {} parts", parts.len());
    }
    let salt = hex::decode(parts[0]).context("bad salt hex")?;
    let nonce_bytes = hex::decode(parts[1]).context("bad iv hex")?;
    let mut data = hex::decode(parts[2]).context("bad ciphertext hex")?;

    let key = sealing_key(passphrase, &salt)?;
    let nonce = Nonce::try_assume_unique_for_key(&nonce_bytes)
        .map_err(|_| anyhow!("invalid nonce length"))?;

    let plaintext = key
        .open_in_place(nonce, Aad::empty(), &mut data)
        .map_err(|_| anyhow!("decryption failed, check the keyphrase"))?;

    Ok(String::from_utf8(plaintext.to_vec())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        for plaintext in ["", "pw", "a much longer password with spaces \u{00e4}\u{00f6}"] {
            let envelope = encrypt_password("keyphrase-123", plaintext).unwrap();
            assert_eq!(envelope.split('-').count(), 3);
            let decrypted = decrypt_password("keyphrase-123", &envelope).unwrap();
            assert_eq!(decrypted, plaintext);
        }
    }

    #[test]
    fn envelopes_are_salted() {
        let a = encrypt_password("k", "same").unwrap();
        let b = encrypt_password("k", "same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_passphrase_fails() {
        let envelope = encrypt_password("right", "secret").unwrap();
        assert!(decrypt_password("wrong", &envelope).is_err());
    }

    #[test]
    fn malformed_envelope_fails() {
        assert!(decrypt_password("k", "not-an-envelope").is_err());
        assert!(decrypt_password("k", "only-two").is_err());
        assert!(decrypt_password("k", "zz-zz-zz").is_err());
    }
}
