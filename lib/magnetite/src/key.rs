use serde::{de, Deserialize, Deserializer};
use serde_derive::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};

const KEY_SIZE: usize = 32;

/// 32 bytes of key material, serialized as base64 in configuration files.
/// Used for both halves of a box keypair and for symmetric keys.
#[derive(Serialize, Deserialize, Clone, Eq, PartialEq, Debug)]
pub struct Key(
    #[serde(serialize_with = "serialize_b64_key", deserialize_with = "deserialize_b64_key")]
    [u8; KEY_SIZE],
);

impl Key {
    pub const SIZE: usize = KEY_SIZE;

    #[inline]
    pub fn new(key: [u8; Self::SIZE]) -> Key {
        Key(key)
    }

    #[inline]
    pub fn zero() -> Key {
        Key([0u8; Self::SIZE])
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; Self::SIZE]
    }
}

impl Deref for Key {
    type Target = [u8; Key::SIZE];

    #[inline]
    fn deref(&self) -> &[u8; Key::SIZE] {
        &self.0
    }
}

impl DerefMut for Key {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8; Key::SIZE] {
        &mut self.0
    }
}

fn serialize_b64_key<S>(key: &[u8; KEY_SIZE], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&base64::encode(&key[..]))
}

fn deserialize_b64_key<'de, D>(deserializer: D) -> Result<[u8; KEY_SIZE], D::Error>
where
    D: Deserializer<'de>,
{
    let s = <&str>::deserialize(deserializer)?;
    let decoded_raw = base64::decode(s).map_err(de::Error::custom)?;

    if decoded_raw.len() != KEY_SIZE {
        return Err(de::Error::custom("key must decode to exactly 32 bytes"));
    }

    let mut decoded = [0u8; KEY_SIZE];
    decoded.copy_from_slice(&decoded_raw);

    Ok(decoded)
}
