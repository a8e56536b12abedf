//! Tagged scalars: a value plus a string tag map, persisted as
//! `urlencode(value) + "," + urlencoded_query(tags)`.
//!
//! Tags are kept in a `BTreeMap`, so the encoded query string is always
//! key-sorted and `encode(decode(s)) == s` holds byte for byte for any `s`
//! produced by [`TaggedScalar::encode`].

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use url::form_urlencoded;

use crate::core::errors::{DiagError, Result};

/// Field name carrying the value in the JSON object form.
pub const VALUE_KEY: &str = "value";

/// String value with an unordered set of string tags.
///
/// The JSON object form carries the value under [`VALUE_KEY`], so a tag
/// named `value` is shadowed there: it survives [`encode`](Self::encode)
/// and [`decode`](Self::decode) but not a JSON round trip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaggedScalar {
    value: String,
    tags: BTreeMap<String, String>,
}

impl TaggedScalar {
    pub fn new<I, K, V>(value: impl Into<String>, tags: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            value: value.into(),
            tags: tags
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Untagged scalar.
    pub fn plain(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            tags: BTreeMap::new(),
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn set_value(&mut self, value: impl Into<String>) {
        self.value = value.into();
    }

    /// Tag value, or `None` when the tag is not set.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn set_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.insert(key.into(), value.into());
    }

    /// Snapshot of all tags.
    pub fn tags(&self) -> BTreeMap<String, String> {
        self.tags.clone()
    }

    /// Text form used for persistence.
    pub fn encode(&self) -> String {
        let value: String = form_urlencoded::byte_serialize(self.value.as_bytes()).collect();
        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.tags.iter())
            .finish();
        format!("{value},{query}")
    }

    /// Parse the text form, splitting on the first `,`.
    ///
    /// A string without any `,` is accepted as an untagged value.
    pub fn decode(raw: &str) -> Result<Self> {
        if raw.contains('\n') {
            return Err(DiagError::malformed(
                "tagged scalar",
                format!("unescaped newline in {raw:?}"),
            ));
        }
        let (value_part, query_part) = raw.split_once(',').unwrap_or((raw, ""));
        let value = decode_component(value_part);
        let mut tags = BTreeMap::new();
        for (k, v) in form_urlencoded::parse(query_part.as_bytes()) {
            // First occurrence wins, matching query-string lookup semantics.
            tags.entry(k.into_owned()).or_insert_with(|| v.into_owned());
        }
        Ok(Self { value, tags })
    }
}

fn decode_component(raw: &str) -> String {
    // `parse` on a bare component yields it as a single key with an empty value.
    let mut padded = String::with_capacity(raw.len() + 1);
    padded.push_str(raw);
    padded.push('=');
    form_urlencoded::parse(padded.as_bytes())
        .next()
        .map(|(k, _)| k.into_owned())
        .unwrap_or_default()
}

impl fmt::Display for TaggedScalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl Serialize for TaggedScalar {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serialize_with_tags(serializer, &self.value, &self.tags)
    }
}

fn serialize_with_tags<S, T>(
    serializer: S,
    value: &T,
    tags: &BTreeMap<String, String>,
) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
    T: Serialize + ?Sized,
{
    if tags.is_empty() {
        return value.serialize(serializer);
    }
    let shown = tags.len() - usize::from(tags.contains_key(VALUE_KEY));
    let mut map = serializer.serialize_map(Some(shown + 1))?;
    for (k, v) in tags {
        if k != VALUE_KEY {
            map.serialize_entry(k, v)?;
        }
    }
    map.serialize_entry(VALUE_KEY, value)?;
    map.end()
}

impl<'de> Deserialize<'de> for TaggedScalar {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(TaggedVisitor)
    }
}

struct TaggedVisitor;

impl<'de> Visitor<'de> for TaggedVisitor {
    type Value = TaggedScalar;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a scalar or an object with a \"value\" field")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
        Ok(TaggedScalar::plain(v))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Self::Value, E> {
        Ok(TaggedScalar::plain(format_float(v)))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Self::Value, E> {
        Ok(TaggedScalar::plain(v.to_string()))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Self::Value, E> {
        Ok(TaggedScalar::plain(v.to_string()))
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<Self::Value, E> {
        Ok(TaggedScalar::plain(v.to_string()))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Self::Value, A::Error> {
        let mut value = None;
        let mut tags = BTreeMap::new();
        while let Some(key) = access.next_key::<String>()? {
            let raw: serde_json::Value = access.next_value()?;
            let text = match raw {
                serde_json::Value::String(s) => s,
                serde_json::Value::Number(n) => n
                    .as_f64()
                    .filter(|_| n.is_f64())
                    .map_or_else(|| n.to_string(), format_float),
                other => other.to_string(),
            };
            if key == VALUE_KEY {
                value = Some(text);
            } else {
                tags.insert(key, text);
            }
        }
        let value = value.ok_or_else(|| de::Error::missing_field(VALUE_KEY))?;
        Ok(TaggedScalar { value, tags })
    }
}

/// Six-decimal float text, the persisted form of numeric scalars.
pub fn format_float(v: f64) -> String {
    format!("{v:.6}")
}

// ──────────────────── numeric variant ────────────────────

/// Numeric tagged scalar. The value text is the float with six decimals;
/// JSON carries it as a number.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaggedFloat {
    inner: TaggedScalar,
}

impl TaggedFloat {
    pub fn new<I, K, V>(value: f64, tags: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            inner: TaggedScalar::new(format_float(value), tags),
        }
    }

    /// Numeric value; unparseable text reads as 0.
    pub fn value(&self) -> f64 {
        self.inner.value().parse::<f64>().unwrap_or(0.0)
    }

    pub fn set_value(&mut self, value: f64) {
        self.inner.set_value(format_float(value));
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.inner.tag(key)
    }

    pub fn set_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.set_tag(key, value);
    }

    pub fn tags(&self) -> BTreeMap<String, String> {
        self.inner.tags()
    }

    pub fn encode(&self) -> String {
        self.inner.encode()
    }

    pub fn decode(raw: &str) -> Result<Self> {
        let inner = TaggedScalar::decode(raw)?;
        inner.value().parse::<f64>().map_err(|e| {
            DiagError::malformed("tagged float", format!("{:?}: {e}", inner.value()))
        })?;
        Ok(Self { inner })
    }
}

impl Serialize for TaggedFloat {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serialize_with_tags(serializer, &self.value(), &self.inner.tags)
    }
}

// ──────────────────── sqlite bridge ────────────────────

#[cfg(feature = "sqlite")]
mod sql {
    use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};

    use super::{TaggedFloat, TaggedScalar};

    impl ToSql for TaggedScalar {
        fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
            Ok(ToSqlOutput::from(self.encode()))
        }
    }

    impl FromSql for TaggedScalar {
        fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
            let raw = value.as_str()?;
            Self::decode(raw).map_err(|e| FromSqlError::Other(Box::new(e)))
        }
    }

    impl ToSql for TaggedFloat {
        fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
            Ok(ToSqlOutput::from(self.encode()))
        }
    }

    impl FromSql for TaggedFloat {
        fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
            let raw = value.as_str()?;
            Self::decode(raw).map_err(|e| FromSqlError::Other(Box::new(e)))
        }
    }
}
