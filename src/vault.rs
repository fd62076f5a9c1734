use std::sync::OnceLock;

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;

pub const VAULT_KEY_ENV: &str = "MAILSYNC_VAULT_KEY";

const KEY_BYTES: usize = 32;
const NONCE_BYTES: usize = 12;
const TAG_BYTES: usize = 16;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("{VAULT_KEY_ENV} must be 64 hex characters (32 bytes)")]
    BadKey,

    #[error("sealed credential is malformed or truncated")]
    Malformed,

    #[error("sealed credential failed authentication")]
    Decryption,

    #[error("credential sealing failed")]
    Seal,
}

/// Authenticated encryption for the long-lived mailbox credential before it
/// is persisted. A sealed blob is `nonce || ciphertext || tag`, one opaque
/// value, so the store needs no side-channel metadata.
pub struct SecretVault {
    key: [u8; KEY_BYTES],
}

static PROCESS_KEY: OnceLock<[u8; KEY_BYTES]> = OnceLock::new();

impl SecretVault {
    pub fn new(key: [u8; KEY_BYTES]) -> Self {
        Self { key }
    }

    /// Loads the key from `MAILSYNC_VAULT_KEY` once per process.
    pub fn from_env() -> Result<Self, VaultError> {
        if let Some(key) = PROCESS_KEY.get() {
            return Ok(Self::new(*key));
        }
        let raw = std::env::var(VAULT_KEY_ENV).map_err(|_| VaultError::BadKey)?;
        let key = parse_key_hex(&raw)?;
        Ok(Self::new(*PROCESS_KEY.get_or_init(|| key)))
    }

    fn aead_key(&self) -> Result<LessSafeKey, VaultError> {
        let unbound = UnboundKey::new(&AES_256_GCM, &self.key).map_err(|_| VaultError::BadKey)?;
        Ok(LessSafeKey::new(unbound))
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, VaultError> {
        let key = self.aead_key()?;

        let mut nonce_bytes = [0u8; NONCE_BYTES];
        SystemRandom::new()
            .fill(&mut nonce_bytes)
            .map_err(|_| VaultError::Seal)?;

        let mut sealed = plaintext.to_vec();
        key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut sealed,
        )
        .map_err(|_| VaultError::Seal)?;

        let mut blob = Vec::with_capacity(NONCE_BYTES + sealed.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&sealed);
        Ok(blob)
    }

    /// Fails loudly on tamper or truncation. A silently-accepted corrupt
    /// credential would cascade into downstream auth failures.
    pub fn open(&self, blob: &[u8]) -> Result<Vec<u8>, VaultError> {
        if blob.len() < NONCE_BYTES + TAG_BYTES {
            return Err(VaultError::Malformed);
        }

        let key = self.aead_key()?;
        let nonce_bytes: [u8; NONCE_BYTES] = blob[..NONCE_BYTES]
            .try_into()
            .map_err(|_| VaultError::Malformed)?;

        let mut ciphertext = blob[NONCE_BYTES..].to_vec();
        let plaintext = key
            .open_in_place(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut ciphertext,
            )
            .map_err(|_| VaultError::Decryption)?;

        Ok(plaintext.to_vec())
    }
}

pub fn parse_key_hex(raw: &str) -> Result<[u8; KEY_BYTES], VaultError> {
    let decoded = hex_decode(raw.trim()).ok_or(VaultError::BadKey)?;
    decoded.try_into().map_err(|_| VaultError::BadKey)
}

fn hex_decode(raw: &str) -> Option<Vec<u8>> {
    if raw.len() % 2 != 0 {
        return None;
    }

    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() / 2);
    let mut idx = 0usize;
    while idx < bytes.len() {
        let hi = decode_hex_nibble(bytes[idx])?;
        let lo = decode_hex_nibble(bytes[idx + 1])?;
        out.push((hi << 4) | lo);
        idx += 2;
    }
    Some(out)
}

fn decode_hex_nibble(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_key_hex, SecretVault, VaultError, NONCE_BYTES};

    const TEST_KEY_HEX: &str = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";

    fn vault() -> SecretVault {
        SecretVault::new(parse_key_hex(TEST_KEY_HEX).expect("parse test key"))
    }

    #[test]
    fn seal_open_round_trip() {
        let vault = vault();
        let sealed = vault.seal(b"1//refresh-token-value").expect("seal");
        let opened = vault.open(&sealed).expect("open");
        assert_eq!(opened, b"1//refresh-token-value");
    }

    #[test]
    fn nonce_is_random_per_call() {
        let vault = vault();
        let first = vault.seal(b"same plaintext").expect("seal first");
        let second = vault.seal(b"same plaintext").expect("seal second");
        assert_ne!(first, second);
    }

    #[test]
    fn flipped_byte_fails_authentication() {
        let vault = vault();
        let mut sealed = vault.seal(b"secret").expect("seal");
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(vault.open(&sealed), Err(VaultError::Decryption)));
    }

    #[test]
    fn flipped_nonce_byte_fails_authentication() {
        let vault = vault();
        let mut sealed = vault.seal(b"secret").expect("seal");
        sealed[0] ^= 0x01;
        assert!(matches!(vault.open(&sealed), Err(VaultError::Decryption)));
    }

    #[test]
    fn truncated_blob_is_malformed() {
        let vault = vault();
        assert!(matches!(
            vault.open(&[0u8; NONCE_BYTES + 2]),
            Err(VaultError::Malformed)
        ));
    }

    #[test]
    fn key_must_be_exactly_32_bytes_of_hex() {
        assert!(matches!(parse_key_hex("00ff"), Err(VaultError::BadKey)));
        assert!(matches!(parse_key_hex("zz"), Err(VaultError::BadKey)));
        assert!(parse_key_hex(TEST_KEY_HEX).is_ok());
    }

    #[test]
    fn wrong_key_cannot_open() {
        let sealed = vault().seal(b"secret").expect("seal");
        let other = SecretVault::new([0x42; 32]);
        assert!(matches!(other.open(&sealed), Err(VaultError::Decryption)));
    }
}
