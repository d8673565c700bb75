//! cryptographic key types for the control protocol.
//!
//! these wrap raw key bytes and serialize to the prefixed hex format the
//! clients expect (e.g. `"nodekey:abc123..."`). the actual cryptographic
//! operations live in ironscale-proto.

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

/// implement prefixed-hex serde for a key newtype.
macro_rules! impl_key_serde {
    ($type:ty, $prefix:expr) => {
        impl Serialize for $type {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                let s = format!("{}:{}", $prefix, hex::encode(&self.0));
                serializer.serialize_str(&s)
            }
        }

        impl<'de> Deserialize<'de> for $type {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                let expected = concat!($prefix, ":");
                let hex_str = s.strip_prefix(expected).ok_or_else(|| {
                    de::Error::custom(format!("key must start with '{}', got '{}'", expected, s))
                })?;
                let bytes = hex::decode(hex_str)
                    .map_err(|e| de::Error::custom(format!("invalid hex in key: {}", e)))?;
                Ok(Self(bytes))
            }
        }

        impl $type {
            /// create a key from raw bytes.
            pub fn from_bytes(bytes: Vec<u8>) -> Self {
                Self(bytes)
            }

            /// raw key bytes.
            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            /// shortened representation for logs.
            pub fn short_string(&self) -> String {
                if self.0.len() >= 2 {
                    format!("{}:{:02x}{:02x}...", $prefix, self.0[0], self.0[1])
                } else {
                    concat!($prefix, ":???").to_string()
                }
            }

            /// whether every byte is zero (an unset key on the wire).
            pub fn is_zero(&self) -> bool {
                self.0.iter().all(|&b| b == 0)
            }

            /// whether the key holds no bytes at all.
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }
    };
}

/// machine key - identifies a physical device.
///
/// stable across node key rotations; it is the static public key of the
/// client's noise handshake. serializes as `"mkey:<hex>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct MachineKey(Vec<u8>);

impl_key_serde!(MachineKey, "mkey");

/// node key - identifies a node's current session.
///
/// rotated by the client over time. serializes as `"nodekey:<hex>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct NodeKey(Vec<u8>);

impl_key_serde!(NodeKey, "nodekey");

/// disco key - used for peer path discovery.
/// serializes as `"discokey:<hex>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DiscoKey(Vec<u8>);

impl_key_serde!(DiscoKey, "discokey");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_key_short_string() {
        let key = MachineKey::from_bytes(vec![0xab, 0xcd, 0xef, 0x12]);
        assert_eq!(key.short_string(), "mkey:abcd...");
    }

    #[test]
    fn empty_key_short_string() {
        let key = NodeKey::default();
        assert_eq!(key.short_string(), "nodekey:???");
    }

    #[test]
    fn node_key_serialize() {
        let key = NodeKey::from_bytes(vec![0x02; 32]);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(
            json,
            "\"nodekey:0202020202020202020202020202020202020202020202020202020202020202\""
        );
    }

    #[test]
    fn node_key_roundtrip() {
        let original = NodeKey::from_bytes(vec![0x11, 0x22, 0x33, 0x44]);
        let json = serde_json::to_string(&original).unwrap();
        let parsed: NodeKey = serde_json::from_str(&json).unwrap();
        assert_eq!(original, parsed);
    }

    #[test]
    fn wrong_prefix_rejected() {
        let json = "\"mkey:0202\"";
        let result: Result<NodeKey, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn zero_key_detection() {
        assert!(NodeKey::from_bytes(vec![0; 32]).is_zero());
        assert!(!NodeKey::from_bytes(vec![1; 32]).is_zero());
    }

    #[test]
    fn disco_key_empty() {
        let key = DiscoKey::default();
        assert!(key.is_empty());
        assert!(!DiscoKey::from_bytes(vec![1]).is_empty());
    }
}
