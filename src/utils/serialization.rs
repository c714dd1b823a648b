// src/utils/serialization.rs
//! Serde adapters for byte fields.

/// `Vec<u8>` as a `0x`-prefixed hex string.
pub mod hex_bytes {
    use ethers_core::utils::hex;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text.strip_prefix("0x").unwrap_or(&text)).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Sample {
        #[serde(with = "hex_bytes")]
        signature: Vec<u8>,
    }

    #[test]
    fn test_hex_bytes_adapter() {
        let sample = Sample { signature: vec![0xab, 0xcd] };
        let json = serde_json::to_string(&sample).unwrap();
        assert_eq!(json, r#"{"signature":"0xabcd"}"#);
        let back: Sample = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sample);

        let bare: Sample = serde_json::from_str(r#"{"signature":"abcd"}"#).unwrap();
        assert_eq!(bare, sample);
    }
}
