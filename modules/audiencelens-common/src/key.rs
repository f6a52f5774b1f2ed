// Subject keys. Identifiers arrive as integers, floats, strings, or JSON
// values depending on the caller; they are normalized here so equality never
// depends on the representation the storage layer happens to see.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::KeyError;

/// Canonical entity identifier: a non-negative `i64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "serde_json::Value", into = "i64")]
pub struct EntityId(i64);

impl EntityId {
    pub fn new(id: i64) -> Result<Self, KeyError> {
        if id < 0 {
            return Err(KeyError::OutOfRange(id.to_string()));
        }
        Ok(Self(id))
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<EntityId> for i64 {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

macro_rules! entity_id_from_int {
    ($($t:ty),*) => {
        $(
            impl TryFrom<$t> for EntityId {
                type Error = KeyError;

                fn try_from(v: $t) -> Result<Self, Self::Error> {
                    let id = i64::try_from(v).map_err(|_| KeyError::OutOfRange(v.to_string()))?;
                    EntityId::new(id)
                }
            }
        )*
    };
}

entity_id_from_int!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

/// 2^63, the first float that no longer fits in an `i64`.
const I64_BOUND: f64 = 9_223_372_036_854_775_808.0;

impl TryFrom<f64> for EntityId {
    type Error = KeyError;

    fn try_from(v: f64) -> Result<Self, Self::Error> {
        if !v.is_finite() || v.fract() != 0.0 {
            return Err(KeyError::NotIntegral(v.to_string()));
        }
        if !(0.0..I64_BOUND).contains(&v) {
            return Err(KeyError::OutOfRange(v.to_string()));
        }
        EntityId::new(v as i64)
    }
}

impl TryFrom<f32> for EntityId {
    type Error = KeyError;

    fn try_from(v: f32) -> Result<Self, Self::Error> {
        EntityId::try_from(f64::from(v))
    }
}

impl TryFrom<&str> for EntityId {
    type Error = KeyError;

    fn try_from(raw: &str) -> Result<Self, Self::Error> {
        let s = raw.trim();
        if let Ok(id) = s.parse::<i64>() {
            return EntityId::new(id);
        }
        match s.parse::<f64>() {
            Ok(f) => EntityId::try_from(f),
            Err(_) => Err(KeyError::Unparseable(raw.to_string())),
        }
    }
}

impl TryFrom<String> for EntityId {
    type Error = KeyError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        EntityId::try_from(raw.as_str())
    }
}

impl TryFrom<&serde_json::Value> for EntityId {
    type Error = KeyError;

    fn try_from(v: &serde_json::Value) -> Result<Self, Self::Error> {
        match v {
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    EntityId::new(i)
                } else if let Some(u) = n.as_u64() {
                    EntityId::try_from(u)
                } else {
                    EntityId::try_from(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => EntityId::try_from(s.as_str()),
            other => Err(KeyError::Unparseable(other.to_string())),
        }
    }
}

impl TryFrom<serde_json::Value> for EntityId {
    type Error = KeyError;

    fn try_from(v: serde_json::Value) -> Result<Self, Self::Error> {
        EntityId::try_from(&v)
    }
}

/// Platform identifier: trimmed, lowercased, never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PlatformId(String);

impl PlatformId {
    pub fn new(raw: &str) -> Result<Self, KeyError> {
        let normalized = raw.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(KeyError::EmptyPlatform);
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlatformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for PlatformId {
    type Error = KeyError;

    fn try_from(raw: &str) -> Result<Self, Self::Error> {
        PlatformId::new(raw)
    }
}

impl TryFrom<String> for PlatformId {
    type Error = KeyError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        PlatformId::new(&raw)
    }
}

impl From<PlatformId> for String {
    fn from(p: PlatformId) -> Self {
        p.0
    }
}

/// One (entity, platform) pair: the cache key and the unit of enrichment work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectKey {
    pub entity: EntityId,
    pub platform: PlatformId,
}

impl SubjectKey {
    pub fn new(entity: EntityId, platform: PlatformId) -> Self {
        Self { entity, platform }
    }

    /// Normalize both halves from whatever representation the caller holds.
    pub fn parse<E>(entity: E, platform: &str) -> Result<Self, KeyError>
    where
        E: TryInto<EntityId>,
        KeyError: From<E::Error>,
    {
        Ok(Self {
            entity: entity.try_into()?,
            platform: PlatformId::new(platform)?,
        })
    }
}

impl fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity, self.platform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_numeric_form_normalizes_to_the_same_id() {
        let canonical = EntityId::new(42).unwrap();
        assert_eq!(EntityId::try_from(42u8).unwrap(), canonical);
        assert_eq!(EntityId::try_from(42u64).unwrap(), canonical);
        assert_eq!(EntityId::try_from(42.0f64).unwrap(), canonical);
        assert_eq!(EntityId::try_from(42.0f32).unwrap(), canonical);
        assert_eq!(EntityId::try_from(" 42 ").unwrap(), canonical);
        assert_eq!(EntityId::try_from("42.0").unwrap(), canonical);
        assert_eq!(EntityId::try_from(&serde_json::json!(42)).unwrap(), canonical);
        assert_eq!(EntityId::try_from(&serde_json::json!(42.0)).unwrap(), canonical);
        assert_eq!(EntityId::try_from(&serde_json::json!("42")).unwrap(), canonical);
    }

    #[test]
    fn non_integral_and_out_of_range_ids_are_rejected() {
        assert!(matches!(EntityId::try_from(42.5f64), Err(KeyError::NotIntegral(_))));
        assert!(matches!(EntityId::try_from(f64::NAN), Err(KeyError::NotIntegral(_))));
        assert!(matches!(EntityId::try_from(f64::INFINITY), Err(KeyError::NotIntegral(_))));
        assert!(matches!(EntityId::try_from(-1i64), Err(KeyError::OutOfRange(_))));
        assert!(matches!(EntityId::try_from(1e19f64), Err(KeyError::OutOfRange(_))));
        assert!(matches!(EntityId::try_from(u64::MAX), Err(KeyError::OutOfRange(_))));
        assert!(matches!(EntityId::try_from("forty-two"), Err(KeyError::Unparseable(_))));
        assert!(matches!(
            EntityId::try_from(&serde_json::json!(null)),
            Err(KeyError::Unparseable(_))
        ));
    }

    #[test]
    fn entity_id_deserializes_through_normalization() {
        let from_float: EntityId = serde_json::from_str("42.0").unwrap();
        let from_str: EntityId = serde_json::from_str("\"42\"").unwrap();
        assert_eq!(from_float, from_str);
        assert_eq!(serde_json::to_string(&from_float).unwrap(), "42");
        assert!(serde_json::from_str::<EntityId>("1.5").is_err());
    }

    #[test]
    fn platform_ids_are_case_and_whitespace_insensitive() {
        assert_eq!(
            PlatformId::new(" Video-Hosting ").unwrap(),
            PlatformId::new("video-hosting").unwrap()
        );
        assert_eq!(PlatformId::new("  "), Err(KeyError::EmptyPlatform));
    }

    #[test]
    fn subject_keys_from_different_representations_are_equal() {
        let a = SubjectKey::parse(42i64, "video-hosting").unwrap();
        let b = SubjectKey::parse(42.0f64, "Video-Hosting").unwrap();
        let c = SubjectKey::parse("42", "video-hosting").unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(a.to_string(), "42:video-hosting");
    }
}
