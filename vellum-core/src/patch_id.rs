//! Globally-unique, lexicographically-orderable patch identifiers.
//!
//! An id is `<time36>_<client>`: the patch's millisecond timestamp encoded
//! as fixed-width base-36 (11 characters, zero-padded), an underscore, and
//! an opaque per-client token. Because the time prefix is fixed-width,
//! sorting ids as plain strings sorts them by time first and client token
//! second — this string order *is* the replay order used everywhere in the
//! graph.
//!
//! Client tokens may themselves contain `_`, so decoding reads a fixed
//! 11-character prefix rather than splitting on the delimiter.

use std::fmt;
use std::sync::Once;
use std::sync::atomic::{AtomicU64, Ordering};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

use crate::error::IdError;

/// Width of the base-36 time prefix.
const TIME_WIDTH: usize = 11;

/// Largest encodable timestamp: 36^11 - 1 milliseconds since epoch.
const MAX_TIME_MS: u64 = 36u64.pow(TIME_WIDTH as u32) - 1;

/// Token used for ids reconstructed from a bare timestamp.
const LEGACY_CLIENT: &str = "legacy";

/// Number of random bytes in a generated client token.
const CLIENT_TOKEN_BYTES: usize = 12;

/// An opaque patch identifier.
///
/// `Ord` is plain string comparison, which by construction equals
/// (time, client-token) order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatchId(String);

/// The two components recovered from a [`PatchId`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedId {
    /// Milliseconds since the Unix epoch.
    pub time_ms: u64,
    /// The per-client token (everything after the fixed prefix).
    pub client_id: String,
}

impl PatchId {
    /// Encode a timestamp and client token into an id.
    pub fn encode(time_ms: u64, client_id: &str) -> Result<Self, IdError> {
        if client_id.is_empty() {
            return Err(IdError::EmptyClient);
        }
        if time_ms > MAX_TIME_MS {
            return Err(IdError::InvalidTime(format!(
                "{time_ms} exceeds maximum encodable time {MAX_TIME_MS}"
            )));
        }
        let mut id = String::with_capacity(TIME_WIDTH + 1 + client_id.len());
        id.push_str(&to_base36(time_ms));
        id.push('_');
        id.push_str(client_id);
        Ok(Self(id))
    }

    /// Encode a timestamp with the fixed `legacy` client token.
    pub fn legacy(time_ms: u64) -> Result<Self, IdError> {
        Self::encode(time_ms, LEGACY_CLIENT)
    }

    /// Wrap an already-encoded id string without validating it.
    ///
    /// Intended for ids read back from a store this process wrote. Ids from
    /// untrusted input should go through [`PatchId::decode`] first.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Split the id back into its timestamp and client token.
    ///
    /// Reads a fixed 11-character prefix; the remainder after the `_` is
    /// the client token verbatim (it may contain further underscores).
    pub fn decode(&self) -> Result<DecodedId, IdError> {
        let raw = &self.0;
        // Prefix, delimiter, and a non-empty token.
        let min = TIME_WIDTH + 2;
        if raw.len() < min {
            return Err(IdError::InvalidLength { len: raw.len(), min });
        }
        if raw.as_bytes()[TIME_WIDTH] != b'_' {
            return Err(IdError::MissingDelimiter);
        }
        let time_ms = from_base36(&raw[..TIME_WIDTH])?;
        Ok(DecodedId {
            time_ms,
            client_id: raw[TIME_WIDTH + 1..].to_string(),
        })
    }

    /// The id's millisecond timestamp, without materializing the token.
    pub fn time_ms(&self) -> Result<u64, IdError> {
        let raw = &self.0;
        let min = TIME_WIDTH + 2;
        if raw.len() < min {
            return Err(IdError::InvalidLength { len: raw.len(), min });
        }
        if raw.as_bytes()[TIME_WIDTH] != b'_' {
            return Err(IdError::MissingDelimiter);
        }
        from_base36(&raw[..TIME_WIDTH])
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PatchId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut buf = [b'0'; TIME_WIDTH];
    let mut i = TIME_WIDTH;
    loop {
        i -= 1;
        buf[i] = DIGITS[(value % 36) as usize];
        value /= 36;
        if value == 0 {
            break;
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn from_base36(text: &str) -> Result<u64, IdError> {
    let mut value: u64 = 0;
    for c in text.chars() {
        let digit = match c {
            '0'..='9' => c as u64 - '0' as u64,
            'a'..='z' => c as u64 - 'a' as u64 + 10,
            _ => {
                return Err(IdError::InvalidTime(format!(
                    "non-base-36 character `{c}` in time prefix"
                )));
            }
        };
        value = value * 36 + digit;
    }
    Ok(value)
}

/// Generate a fresh client token: 96 random bits, base64url, no padding.
///
/// Uses the operating system's CSPRNG. If the OS RNG is unavailable the
/// token falls back to clock + counter entropy — unique enough to avoid
/// collisions between well-behaved peers, but out of contract for anything
/// adversarial; a warning is logged once.
pub fn client_token() -> String {
    let mut bytes = [0u8; CLIENT_TOKEN_BYTES];
    match getrandom::getrandom(&mut bytes) {
        Ok(()) => URL_SAFE_NO_PAD.encode(bytes),
        Err(_) => weak_client_token(),
    }
}

static WEAK_TOKEN_WARNING: Once = Once::new();
static WEAK_TOKEN_COUNTER: AtomicU64 = AtomicU64::new(0);

fn weak_client_token() -> String {
    WEAK_TOKEN_WARNING.call_once(|| {
        log::warn!("OS RNG unavailable; falling back to weak client tokens");
    });
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let count = WEAK_TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed);
    // splitmix64 over the combined seed, twice, for 12 bytes of output
    let mut seed = nanos ^ count.rotate_left(32) ^ 0x6c62_272e_07bb_0142;
    let mut bytes = [0u8; CLIENT_TOKEN_BYTES];
    for chunk in bytes.chunks_mut(8) {
        seed = seed.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = seed;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^= z >> 31;
        let out = z.to_le_bytes();
        let n = chunk.len();
        chunk.copy_from_slice(&out[..n]);
    }
    URL_SAFE_NO_PAD.encode(bytes)
}
