//! Query keys.
//!
//! A [`QueryKey`] is an ordered sequence of primitive [`KeyPart`]s. Keys
//! are compared structurally: two keys are equal iff their parts are
//! equal element by element. Numbers are normalized on construction so
//! that every path to the same value produces the same part (`1`, `1u8`
//! and `1.0` are one integer part), while text and numbers stay distinct
//! element types (`1 != "1"`).
//!
//! Keys are hierarchical by convention: the leading parts name an entity
//! namespace (`["pool", 7]`), the trailing parts name the operation
//! (`["sharePrices", "5f1c…"]`). See [`crate::entity`].
//!
//! ```rust
//! use chain_query::key;
//!
//! let k = key!["pool", 7, "nav"];
//! assert!(k.starts_with(&key!["pool", 7]));
//! assert_ne!(key![1], key!["1"]);
//! assert_eq!(key![1], key![1.0]);
//! ```

use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Build a [`QueryKey`] from heterogeneous parts.
///
/// Every part goes through `KeyPart::from`, so any type with a
/// `From<T> for KeyPart` impl can be used.
#[macro_export]
macro_rules! key {
    () => {
        $crate::key::QueryKey::default()
    };
    ($($part:expr),+ $(,)?) => {
        $crate::key::QueryKey::new(vec![$($crate::key::KeyPart::from($part)),+])
    };
}

/// Whether a key requests an uncached invocation.
pub fn is_uncached(key: Option<&QueryKey>) -> bool {
    key.is_none()
}

/// A single element of a [`QueryKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyPart {
    /// Explicit "absent" marker (e.g. an unset optional filter).
    Absent,
    Bool(bool),
    Int(i128),
    /// Non-integral float. Integral floats normalize to [`KeyPart::Int`].
    Float(KeyFloat),
    Text(Arc<str>),
}

impl KeyPart {
    pub fn text(s: impl AsRef<str>) -> Self {
        KeyPart::Text(Arc::from(s.as_ref()))
    }

    /// Normalize a float: integral values that fit in `i128` become
    /// [`KeyPart::Int`], `-0.0` becomes `0`, every NaN is the same part.
    pub fn float(v: f64) -> Self {
        if v.is_finite() && v.fract() == 0.0 && v >= i128::MIN as f64 && v < i128::MAX as f64 {
            KeyPart::Int(v as i128)
        } else if v.is_nan() {
            KeyPart::Float(KeyFloat(f64::NAN))
        } else {
            KeyPart::Float(KeyFloat(v))
        }
    }

    /// Stable text part derived from an arbitrary serializable value.
    ///
    /// Used for operation-local parts built from filter structs (date
    /// ranges, pagination), where the whole filter identifies the query.
    /// Map ordering does not affect the digest.
    pub fn digest<S: Serialize + ?Sized>(value: &S) -> Result<Self> {
        // Round-trip through `Value` so object keys are sorted.
        let canonical = serde_json::to_string(&serde_json::to_value(value)?)?;
        let mut hasher = DefaultHasher::new();
        canonical.hash(&mut hasher);
        Ok(KeyPart::Text(Arc::from(format!("{:016x}", hasher.finish()))))
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, KeyPart::Absent)
    }
}

/// Canonical non-integral float inside a [`KeyPart`].
///
/// Equality and hashing use the bit pattern, which is sound because
/// construction through [`KeyPart::float`] removes `-0.0` and collapses
/// NaNs.
#[derive(Debug, Clone, Copy)]
pub struct KeyFloat(f64);

impl KeyFloat {
    pub fn get(self) -> f64 {
        self.0
    }
}

impl PartialEq for KeyFloat {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for KeyFloat {}

impl Hash for KeyFloat {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl PartialOrd for KeyFloat {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyFloat {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

macro_rules! int_key_part {
    ($($t:ty),*) => {
        $(
            impl From<$t> for KeyPart {
                fn from(v: $t) -> Self {
                    KeyPart::Int(v as i128)
                }
            }
        )*
    };
}

int_key_part!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, usize);

/// Values above `i128::MAX` (large token amounts, hashes read as numbers)
/// become their decimal text.
impl From<u128> for KeyPart {
    fn from(v: u128) -> Self {
        i128::try_from(v).map_or_else(|_| KeyPart::Text(Arc::from(v.to_string())), KeyPart::Int)
    }
}

impl From<f64> for KeyPart {
    fn from(v: f64) -> Self {
        KeyPart::float(v)
    }
}

impl From<f32> for KeyPart {
    fn from(v: f32) -> Self {
        KeyPart::float(v as f64)
    }
}

impl From<bool> for KeyPart {
    fn from(v: bool) -> Self {
        KeyPart::Bool(v)
    }
}

impl From<&str> for KeyPart {
    fn from(v: &str) -> Self {
        KeyPart::text(v)
    }
}

impl From<String> for KeyPart {
    fn from(v: String) -> Self {
        KeyPart::Text(Arc::from(v))
    }
}

impl From<&String> for KeyPart {
    fn from(v: &String) -> Self {
        KeyPart::text(v)
    }
}

impl<T: Into<KeyPart>> From<Option<T>> for KeyPart {
    fn from(v: Option<T>) -> Self {
        v.map_or(KeyPart::Absent, Into::into)
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Absent => f.write_str("null"),
            KeyPart::Bool(b) => write!(f, "{b}"),
            KeyPart::Int(i) => write!(f, "{i}"),
            KeyPart::Float(x) => write!(f, "{}", x.0),
            KeyPart::Text(s) => write!(f, "{s:?}"),
        }
    }
}

impl Serialize for KeyPart {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            KeyPart::Absent => serializer.serialize_none(),
            KeyPart::Bool(b) => serializer.serialize_bool(*b),
            KeyPart::Int(i) => match i64::try_from(*i) {
                Ok(small) => serializer.serialize_i64(small),
                Err(_) => serializer.serialize_i128(*i),
            },
            KeyPart::Float(x) => serializer.serialize_f64(x.0),
            KeyPart::Text(s) => serializer.serialize_str(s),
        }
    }
}

struct KeyPartVisitor;

impl<'de> Visitor<'de> for KeyPartVisitor {
    type Value = KeyPart;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("null, a boolean, a number or a string")
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<KeyPart, E> {
        Ok(KeyPart::Absent)
    }

    fn visit_none<E: de::Error>(self) -> std::result::Result<KeyPart, E> {
        Ok(KeyPart::Absent)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<KeyPart, E> {
        Ok(KeyPart::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<KeyPart, E> {
        Ok(KeyPart::Int(v as i128))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<KeyPart, E> {
        Ok(KeyPart::Int(v as i128))
    }

    fn visit_i128<E: de::Error>(self, v: i128) -> std::result::Result<KeyPart, E> {
        Ok(KeyPart::Int(v))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<KeyPart, E> {
        Ok(KeyPart::float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<KeyPart, E> {
        Ok(KeyPart::text(v))
    }
}

impl<'de> Deserialize<'de> for KeyPart {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(KeyPartVisitor)
    }
}

/// Ordered, structurally comparable cache key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey(Vec<KeyPart>);

impl QueryKey {
    pub fn new(parts: Vec<KeyPart>) -> Self {
        Self(parts)
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `prefix` is a leading segment of this key.
    ///
    /// The empty key is a prefix of every key.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Concatenate `self ++ suffix`.
    pub fn join(&self, suffix: &QueryKey) -> QueryKey {
        let mut parts = Vec::with_capacity(self.0.len() + suffix.0.len());
        parts.extend_from_slice(&self.0);
        parts.extend_from_slice(&suffix.0);
        QueryKey(parts)
    }

    /// Append a single part.
    pub fn push(mut self, part: impl Into<KeyPart>) -> QueryKey {
        self.0.push(part.into());
        self
    }
}

impl From<Vec<KeyPart>> for QueryKey {
    fn from(parts: Vec<KeyPart>) -> Self {
        Self(parts)
    }
}

impl FromIterator<KeyPart> for QueryKey {
    fn from_iter<I: IntoIterator<Item = KeyPart>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{part}")?;
        }
        f.write_str("]")
    }
}

impl Serialize for QueryKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for part in &self.0 {
            seq.serialize_element(part)?;
        }
        seq.end()
    }
}

struct QueryKeyVisitor;

impl<'de> Visitor<'de> for QueryKeyVisitor {
    type Value = QueryKey;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a sequence of key parts")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<QueryKey, A::Error> {
        let mut parts = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(part) = seq.next_element::<KeyPart>()? {
            parts.push(part);
        }
        Ok(QueryKey(parts))
    }
}

impl<'de> Deserialize<'de> for QueryKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_seq(QueryKeyVisitor)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn hash_of(key: &QueryKey) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn equal_regardless_of_construction_path() {
        let a = key!["pool", 7u64, "nav"];
        let b = QueryKey::new(vec![
            KeyPart::text("pool"),
            KeyPart::Int(7),
            KeyPart::from(String::from("nav")),
        ]);
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn numbers_and_text_are_distinct() {
        assert_ne!(key![1], key!["1"]);
        assert_ne!(key![true], key!["true"]);
        assert_ne!(key![Option::<u8>::None], key!["null"]);
    }

    #[test]
    fn integral_floats_normalize_to_ints() {
        assert_eq!(key![1.0], key![1]);
        assert_eq!(key![-0.0], key![0]);
        assert_eq!(hash_of(&key![2.0f32]), hash_of(&key![2i8]));
        assert_ne!(key![1.5], key![1]);
    }

    #[test]
    fn u128_parts() {
        assert_eq!(key![7u128], key![7]);
        assert_eq!(KeyPart::from(i128::MAX as u128), KeyPart::Int(i128::MAX));
        assert_eq!(
            KeyPart::from(u128::MAX),
            KeyPart::text("340282366920938463463374607431768211455")
        );
    }

    #[test]
    fn nan_parts_are_equal() {
        assert_eq!(key![f64::NAN], key![-f64::NAN]);
    }

    #[test]
    fn option_none_is_absent() {
        let part = KeyPart::from(Option::<&str>::None);
        assert!(part.is_absent());
        assert_eq!(KeyPart::from(Some("x")), KeyPart::text("x"));
    }

    #[test]
    fn keys_are_usable_as_set_members() {
        let mut set = HashSet::new();
        set.insert(key!["pool", 1]);
        set.insert(key!["pool", 1.0]);
        set.insert(key!["pool", "1"]);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn prefix_and_join() {
        let prefix = key!["pool", 7];
        let full = prefix.join(&key!["nav"]);
        assert_eq!(full, key!["pool", 7, "nav"]);
        assert!(full.starts_with(&prefix));
        assert!(full.starts_with(&QueryKey::default()));
        assert!(!full.starts_with(&key!["pool", 8]));
        assert!(!prefix.starts_with(&full));
    }

    #[test]
    fn display_renders_parts() {
        let k = key!["pool", 7, true, Option::<u8>::None, 1.5];
        assert_eq!(k.to_string(), r#"["pool", 7, true, null, 1.5]"#);
    }

    #[test]
    fn json_shape() {
        let k = key!["pool", 7, Option::<u8>::None, false];
        let json = serde_json::to_string(&k).unwrap();
        assert_eq!(json, r#"["pool",7,null,false]"#);
        let back: QueryKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, k);
    }

    #[test]
    fn digest_ignores_map_order() {
        let a = serde_json::json!({ "from": 1, "to": 2 });
        let b = serde_json::json!({ "to": 2, "from": 1 });
        assert_eq!(KeyPart::digest(&a).unwrap(), KeyPart::digest(&b).unwrap());
        let c = serde_json::json!({ "from": 1, "to": 3 });
        assert_ne!(KeyPart::digest(&a).unwrap(), KeyPart::digest(&c).unwrap());
    }

    #[test]
    fn uncached_only_when_absent() {
        assert!(is_uncached(None));
        assert!(!is_uncached(Some(&key!["pool"])));
    }
}
