//! Client-side envelope encryption.
//!
//! The sender seals content with a fresh AES-128-GCM key and uploads only the
//! envelope. The key travels in the URL fragment of the share link, which
//! browsers never send to the server, so the server stores ciphertext it
//! cannot open. Non-browser clients must keep the key out of request paths
//! and bodies themselves; [`split_share_link`] does that for them.
//!
//! Envelope layout, base64 (standard alphabet, padded):
//!
//! ```text
//! [NONCE(12)][CIPHERTEXT(N)][TAG(16)]
//! ```

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Key, Nonce};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::ZeroizeOnDrop;

use crate::error::{Error, Result};

pub const KEY_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// 128-bit envelope key. Lives only on the client.
#[derive(Clone, PartialEq, Eq, ZeroizeOnDrop)]
pub struct EnvelopeKey([u8; KEY_LEN]);

impl EnvelopeKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            Error::Encryption(format!(
                "key must be {KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for EnvelopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EnvelopeKey(..)")
    }
}

/// Generate a fresh key from the OS random source.
pub fn generate_key() -> Result<EnvelopeKey> {
    let mut key = [0u8; KEY_LEN];
    OsRng.try_fill_bytes(&mut key).map_err(|_| Error::Entropy)?;
    Ok(EnvelopeKey(key))
}

/// Seal `plaintext` under `key` with a fresh random nonce.
pub fn seal(plaintext: &[u8], key: &EnvelopeKey) -> Result<String> {
    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key.as_bytes()));

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.try_fill_bytes(&mut nonce).map_err(|_| Error::Entropy)?;

    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| Error::Encryption(format!("seal: {e}")))?;

    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(STANDARD.encode(out))
}

/// Open an envelope. A wrong key or any tampering fails authentication;
/// no partial plaintext is ever returned.
pub fn open(envelope: &str, key: &EnvelopeKey) -> Result<Vec<u8>> {
    let raw = STANDARD
        .decode(envelope.trim())
        .map_err(|e| Error::Encryption(format!("envelope is not base64: {e}")))?;

    if raw.len() < NONCE_LEN + TAG_LEN {
        return Err(Error::Encryption("envelope too short".into()));
    }
    let (nonce, sealed) = raw.split_at(NONCE_LEN);

    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key.as_bytes()));
    cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| Error::Encryption("authentication failed".into()))
}

/// Check framing only: valid base64 holding at least a nonce and a tag.
/// Never decrypts.
pub fn looks_like_envelope(envelope: &str) -> bool {
    STANDARD
        .decode(envelope.trim())
        .map(|raw| raw.len() >= NONCE_LEN + TAG_LEN)
        .unwrap_or(false)
}

/// URL-safe, unpadded encoding for the fragment.
pub fn encode_key(key: &EnvelopeKey) -> String {
    URL_SAFE_NO_PAD.encode(key.as_bytes())
}

pub fn decode_key(encoded: &str) -> Result<EnvelopeKey> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| Error::Encryption(format!("key is not base64url: {e}")))?;
    EnvelopeKey::from_bytes(&bytes)
}

/// Build a share link, appending the key as the fragment when present.
pub fn share_link(base: &str, path: &str, key: Option<&EnvelopeKey>) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    match key {
        Some(key) => format!("{base}/{path}#{}", encode_key(key)),
        None => format!("{base}/{path}"),
    }
}

/// Split a share link into the part that may be requested and the key.
/// The returned URL never contains the fragment.
pub fn split_share_link(link: &str) -> Result<(String, Option<EnvelopeKey>)> {
    match link.split_once('#') {
        Some((url, fragment)) if !fragment.is_empty() => {
            Ok((url.to_owned(), Some(decode_key(fragment)?)))
        }
        Some((url, _)) => Ok((url.to_owned(), None)),
        None => Ok((link.to_owned(), None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let key = generate_key().unwrap();
        let envelope = seal(b"hello, blip!", &key).unwrap();
        assert_eq!(open(&envelope, &key).unwrap(), b"hello, blip!");
    }

    #[test]
    fn round_trip_empty_and_large() {
        let key = generate_key().unwrap();

        let empty = seal(b"", &key).unwrap();
        assert!(open(&empty, &key).unwrap().is_empty());
        assert!(looks_like_envelope(&empty));

        let big: Vec<u8> = (0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        let envelope = seal(&big, &key).unwrap();
        assert_eq!(open(&envelope, &key).unwrap(), big);
    }

    #[test]
    fn nonce_is_fresh_per_seal() {
        let key = generate_key().unwrap();
        assert_ne!(seal(b"same", &key).unwrap(), seal(b"same", &key).unwrap());
    }

    #[test]
    fn wrong_key_fails() {
        let key1 = generate_key().unwrap();
        let key2 = generate_key().unwrap();
        let envelope = seal(b"secret", &key1).unwrap();
        assert!(matches!(open(&envelope, &key2), Err(Error::Encryption(_))));
    }

    #[test]
    fn every_flipped_byte_fails() {
        let key = generate_key().unwrap();
        let envelope = seal(b"tamper with me", &key).unwrap();
        let raw = STANDARD.decode(&envelope).unwrap();

        for i in 0..raw.len() {
            let mut bad = raw.clone();
            bad[i] ^= 0x01;
            assert!(
                open(&STANDARD.encode(&bad), &key).is_err(),
                "flip at byte {i} was accepted"
            );
        }
    }

    #[test]
    fn truncated_envelope_fails() {
        let key = generate_key().unwrap();
        let short = STANDARD.encode([0u8; NONCE_LEN + TAG_LEN - 1]);
        assert!(matches!(open(&short, &key), Err(Error::Encryption(_))));
        assert!(!looks_like_envelope(&short));
        assert!(matches!(open("not base64!!", &key), Err(Error::Encryption(_))));
    }

    #[test]
    fn key_encoding_is_url_safe_and_checked() {
        let key = generate_key().unwrap();
        let encoded = encode_key(&key);
        assert_eq!(encoded.len(), 22);
        assert!(!encoded.contains(['+', '/', '=']));
        assert_eq!(decode_key(&encoded).unwrap(), key);

        let too_short = URL_SAFE_NO_PAD.encode([0u8; 8]);
        assert!(matches!(decode_key(&too_short), Err(Error::Encryption(_))));
    }

    #[test]
    fn share_link_keeps_key_in_fragment() {
        let key = generate_key().unwrap();
        let link = share_link("https://blip.example/", "/s/AbC123", Some(&key));
        assert_eq!(
            link,
            format!("https://blip.example/s/AbC123#{}", encode_key(&key))
        );

        let (url, recovered) = split_share_link(&link).unwrap();
        assert_eq!(url, "https://blip.example/s/AbC123");
        assert_eq!(recovered.unwrap(), key);

        let (url, none) = split_share_link("https://blip.example/p/AbC123").unwrap();
        assert_eq!(url, "https://blip.example/p/AbC123");
        assert!(none.is_none());
    }
}
