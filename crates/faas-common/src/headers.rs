//! Header encoding convention for HTTP-flavored invocations.
//!
//! Metadata values are flat strings, so a header map travels as a single
//! string: entries joined by [`HEADER_DELIM`], key and value joined by
//! [`HEADER_EQUALS`]. Both tokens are part of the wire contract with the
//! orchestrator and must never be changed independently of it.

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

pub const HEADER_DELIM: &str = "&__header_delim__&";
pub const HEADER_EQUALS: &str = "&__header_equals__&";

/// Insertion-ordered header map.
///
/// Inserting an existing key replaces its value in place, so a key keeps the
/// position of its first occurrence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Case-insensitive presence check, as HTTP header names are.
    pub fn contains_ignore_case(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k.eq_ignore_ascii_case(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

impl Serialize for Headers {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Headers {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HeadersVisitor;

        impl<'de> Visitor<'de> for HeadersVisitor {
            type Value = Headers;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of string header values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Headers, A::Error> {
                let mut headers = Headers::new();
                while let Some((k, v)) = access.next_entry::<String, String>()? {
                    headers.insert(k, v);
                }
                Ok(headers)
            }
        }

        deserializer.deserialize_map(HeadersVisitor)
    }
}

/// Flattens headers into the single-string wire form.
pub fn encode_headers(headers: &Headers) -> String {
    headers
        .iter()
        .map(|(k, v)| format!("{k}{HEADER_EQUALS}{v}"))
        .collect::<Vec<_>>()
        .join(HEADER_DELIM)
}

/// Like [`encode_headers`], but `None` when the wire form would not decode
/// back to the same headers, e.g. a value ending in a prefix of a separator
/// token.
pub fn try_encode_headers(headers: &Headers) -> Option<String> {
    let wire = encode_headers(headers);
    (decode_headers(&wire) == *headers).then_some(wire)
}

/// Parses the wire form back into headers.
///
/// Splits on the entry separator first, then on the first key/value
/// separator of each entry. Empty entries are skipped; an entry without a
/// key/value separator becomes a header with an empty value.
pub fn decode_headers(raw: &str) -> Headers {
    let mut headers = Headers::new();
    for entry in raw.split(HEADER_DELIM).filter(|e| !e.is_empty()) {
        match entry.split_once(HEADER_EQUALS) {
            Some((k, v)) => headers.insert(k, v),
            None => headers.insert(entry, ""),
        }
    }
    headers
}
