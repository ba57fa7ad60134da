//! Serde adapter encoding `BigInt` as a base-10 string.
//!
//! Use with `#[serde(with = "crate::utils::bigint_str")]`.

use num_bigint::BigInt;
use serde::{de, Deserialize, Deserializer, Serializer};
use std::str::FromStr;

pub fn serialize<S>(value: &BigInt, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&value.to_string())
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<BigInt, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    BigInt::from_str(&raw).map_err(de::Error::custom)
}

/// Same encoding for `BTreeMap<u32, BigInt>` values.
pub mod map {
    use super::*;
    use serde::ser::SerializeMap;
    use std::collections::BTreeMap;

    pub fn serialize<S>(value: &BTreeMap<u32, BigInt>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(value.len()))?;
        for (k, v) in value {
            map.serialize_entry(k, &v.to_string())?;
        }
        map.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<u32, BigInt>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<u32, String>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(k, v)| BigInt::from_str(&v).map(|v| (k, v)).map_err(de::Error::custom))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use num_bigint::BigInt;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Wrapper {
        #[serde(with = "super")]
        value: BigInt,
    }

    #[test]
    fn test_encodes_as_string() {
        let json = serde_json::to_string(&Wrapper {
            value: BigInt::from(-123_456_789_012_345_678_901i128),
        })
        .unwrap();
        assert_eq!(json, r#"{"value":"-123456789012345678901"}"#);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(serde_json::from_str::<Wrapper>(r#"{"value":"12x"}"#).is_err());
    }
}
