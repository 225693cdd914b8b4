use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// 256-bit blake3 digest used as the sole content identity in the store.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; 32]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn of(bytes: &[u8]) -> Self {
        Self(blake3::hash(bytes).into())
    }

    pub fn from_hex(s: &str) -> crate::Result<Self> {
        let bytes = hex::decode(s).map_err(|_| Error::InvalidHashHex(s.to_string()))?;
        if bytes.len() != 32 {
            return Err(Error::InvalidHashHex(s.to_string()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", &self.to_hex()[..12])
    }
}

impl Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// streaming hasher for blobs written incrementally.
pub struct BlobHasher {
    hasher: blake3::Hasher,
}

impl Default for BlobHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobHasher {
    pub fn new() -> Self {
        Self {
            hasher: blake3::Hasher::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(self) -> Hash {
        Hash(self.hasher.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let original =
            Hash::from_hex("abcdef0123456789abcdef0123456789abcdef0123456789abcdef0123456789")
                .unwrap();
        let parsed = Hash::from_hex(&original.to_hex()).unwrap();
        assert_eq!(original, parsed);
    }

    #[test]
    fn invalid_hex_rejected() {
        assert!(Hash::from_hex("not valid hex").is_err());
        assert!(Hash::from_hex("abcd").is_err());
    }

    #[test]
    fn of_is_deterministic_and_content_sensitive() {
        let a = Hash::of(b"hello");
        let b = Hash::of(b"hello");
        let c = Hash::of(b"world");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn streaming_matches_oneshot() {
        let direct = Hash::of(b"helloworld");
        let mut streaming = BlobHasher::new();
        streaming.update(b"hello");
        streaming.update(b"world");
        assert_eq!(direct, streaming.finalize());
    }

    #[test]
    fn ordering_is_byte_lexical() {
        let h1 = Hash::from_bytes([0u8; 32]);
        let mut bytes = [0u8; 32];
        bytes[31] = 1;
        let h2 = Hash::from_bytes(bytes);
        assert!(h1 < h2);
    }
}
