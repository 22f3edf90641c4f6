//! Short code allocation.
//!
//! A short code is six symbols from a fixed 64-symbol URL-safe alphabet, so
//! the code space is 64^6. Codes are not reserved: once a record is consumed
//! or expires its code may be handed out again.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const SHORT_LEN: usize = 6;

const ALPHABET: &[u8; 64] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_";

/// A validated six-character short code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ShortCode(String);

impl ShortCode {
    /// Validate caller-supplied input. Anything that is not exactly six
    /// alphabet symbols is an invalid identifier, never a lookup miss.
    pub fn parse(s: &str) -> Result<Self> {
        if s.len() != SHORT_LEN || !s.bytes().all(|b| ALPHABET.contains(&b)) {
            return Err(Error::InvalidIdentifier);
        }
        Ok(Self(s.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShortCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ShortCode {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ShortCode {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ShortCode> for String {
    fn from(code: ShortCode) -> Self {
        code.0
    }
}

/// Draw a fresh code from the OS random source.
///
/// A failing random source is an error; there is no fallback to a weaker
/// generator. Collision handling is left to the store.
pub fn allocate() -> Result<ShortCode> {
    let mut bytes = [0u8; SHORT_LEN];
    OsRng.try_fill_bytes(&mut bytes).map_err(|_| Error::Entropy)?;
    Ok(encode(bytes))
}

fn encode(bytes: [u8; SHORT_LEN]) -> ShortCode {
    let code = bytes
        .iter()
        .map(|b| ALPHABET[(b % 64) as usize] as char)
        .collect();
    ShortCode(code)
}
