//! Directory entries and their attributes.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

/// Reserved map key carrying the distinguished name in the map projection.
pub const MAP_DN_KEY: &str = "dn";

/// Map projection of an entry: the DN under [`MAP_DN_KEY`] plus one key per attribute.
pub type EntryMap = BTreeMap<String, MapValue>;

/// A single attribute value: text or raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// UTF-8 value.
    Text(String),
    /// Binary value such as a certificate or a JPEG photo.
    Binary(Vec<u8>),
}

impl AttributeValue {
    /// Returns the value as text when it is not binary.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }

    /// Raw bytes of the value (UTF-8 bytes for text).
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }

    /// Returns true for binary values.
    #[must_use]
    pub const fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }

    /// Consumes the value and returns its bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Text(text) => text.into_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Binary(bytes) => write!(f, "<{} bytes>", bytes.len()),
        }
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<Vec<u8>> for AttributeValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(value)
    }
}

impl From<&[u8]> for AttributeValue {
    fn from(value: &[u8]) -> Self {
        Self::Binary(value.to_vec())
    }
}

/// Value of one attribute in the map projection.
///
/// `Multi` is listed first so that an empty JSON array reads back as an empty collection
/// rather than an empty binary scalar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MapValue {
    /// Ordered collection of values.
    Multi(Vec<AttributeValue>),
    /// Scalar value.
    Single(AttributeValue),
}

impl From<AttributeValue> for MapValue {
    fn from(value: AttributeValue) -> Self {
        Self::Single(value)
    }
}

impl From<&str> for MapValue {
    fn from(value: &str) -> Self {
        Self::Single(value.into())
    }
}

impl From<String> for MapValue {
    fn from(value: String) -> Self {
        Self::Single(value.into())
    }
}

impl<V: Into<AttributeValue>> From<Vec<V>> for MapValue {
    fn from(values: Vec<V>) -> Self {
        Self::Multi(values.into_iter().map(Into::into).collect())
    }
}

/// A named attribute, single- or multi-valued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    /// Holds exactly one value, or none.
    Single {
        /// Attribute name as supplied (case preserved).
        name: String,
        /// The value, if any.
        value: Option<AttributeValue>,
    },
    /// Holds a collection of values whose order carries no meaning.
    Multi {
        /// Attribute name as supplied (case preserved).
        name: String,
        /// The values.
        values: Vec<AttributeValue>,
    },
}

impl Attribute {
    /// Creates a single-valued attribute.
    #[must_use]
    pub fn single(name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self::Single {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    /// Creates a single-valued attribute holding no value.
    #[must_use]
    pub fn empty(name: impl Into<String>) -> Self {
        Self::Single {
            name: name.into(),
            value: None,
        }
    }

    /// Creates a multi-valued attribute.
    #[must_use]
    pub fn multi<I, V>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<AttributeValue>,
    {
        Self::Multi {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Builds an attribute from values returned by a server: more than one value yields a
    /// multi-valued attribute, otherwise a single-valued one.
    #[must_use]
    pub fn from_values(name: impl Into<String>, mut values: Vec<AttributeValue>) -> Self {
        if values.len() > 1 {
            Self::Multi {
                name: name.into(),
                values,
            }
        } else {
            Self::Single {
                name: name.into(),
                value: values.pop(),
            }
        }
    }

    /// Builds an attribute from its map projection.
    #[must_use]
    pub fn from_map_value(name: impl Into<String>, value: MapValue) -> Self {
        match value {
            MapValue::Single(value) => Self::Single {
                name: name.into(),
                value: Some(value),
            },
            MapValue::Multi(values) => Self::Multi {
                name: name.into(),
                values,
            },
        }
    }

    /// Attribute name with its original case.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Single { name, .. } | Self::Multi { name, .. } => name,
        }
    }

    /// Lowercased name used for lookups.
    #[must_use]
    pub fn key(&self) -> String {
        self.name().to_ascii_lowercase()
    }

    /// The value of a single-valued attribute, or the first value of a multi-valued one.
    #[must_use]
    pub fn value(&self) -> Option<&AttributeValue> {
        match self {
            Self::Single { value, .. } => value.as_ref(),
            Self::Multi { values, .. } => values.first(),
        }
    }

    /// All values as a slice.
    #[must_use]
    pub fn values(&self) -> &[AttributeValue] {
        match self {
            Self::Single { value, .. } => value.as_slice(),
            Self::Multi { values, .. } => values,
        }
    }

    /// Returns true for multi-valued attributes.
    #[must_use]
    pub const fn is_multi_valued(&self) -> bool {
        matches!(self, Self::Multi { .. })
    }

    /// Returns true when the attribute holds no value.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values().is_empty()
    }

    /// Returns true if `value` is one of the attribute's values.
    #[must_use]
    pub fn contains(&self, value: &AttributeValue) -> bool {
        self.values().contains(value)
    }

    /// Adds a value. A single-valued attribute that already holds a value becomes
    /// multi-valued.
    pub fn add_value(&mut self, value: impl Into<AttributeValue>) {
        let value = value.into();
        match self {
            Self::Single { value: slot @ None, .. } => *slot = Some(value),
            Self::Single { name, value: Some(existing) } => {
                let name = std::mem::take(name);
                let first = existing.clone();
                *self = Self::Multi {
                    name,
                    values: vec![first, value],
                };
            }
            Self::Multi { values, .. } => values.push(value),
        }
    }

    /// Removes every occurrence of `value`, returning true if anything was removed.
    pub fn remove_value(&mut self, value: &AttributeValue) -> bool {
        match self {
            Self::Single { value: slot, .. } => {
                if slot.as_ref() == Some(value) {
                    *slot = None;
                    true
                } else {
                    false
                }
            }
            Self::Multi { values, .. } => {
                let before = values.len();
                values.retain(|candidate| candidate != value);
                values.len() != before
            }
        }
    }

    /// Consumes the attribute and returns its values.
    #[must_use]
    pub fn into_values(self) -> Vec<AttributeValue> {
        match self {
            Self::Single { value, .. } => value.into_iter().collect(),
            Self::Multi { values, .. } => values,
        }
    }

    /// Map projection of the attribute's values. A valueless single attribute projects to an
    /// empty collection.
    #[must_use]
    pub fn to_map_value(&self) -> MapValue {
        match self {
            Self::Single { value: Some(value), .. } => MapValue::Single(value.clone()),
            Self::Single { value: None, .. } => MapValue::Multi(Vec::new()),
            Self::Multi { values, .. } => MapValue::Multi(values.clone()),
        }
    }

    /// Compares names case-insensitively and values as sets.
    #[must_use]
    pub fn same_values(&self, other: &Self) -> bool {
        self.name().eq_ignore_ascii_case(other.name())
            && self.values().iter().all(|value| other.contains(value))
            && other.values().iter().all(|value| self.contains(value))
    }
}

/// A directory entry: a DN plus its attributes.
///
/// Attribute names are matched case-insensitively; the case used when an attribute was added
/// is kept for display. Two entries are equal when their DNs are equal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(into = "EntryMap", try_from = "EntryMap")]
pub struct Entry {
    dn: String,
    attributes: Vec<Attribute>,
}

impl Entry {
    /// Creates an entry with no attributes.
    #[must_use]
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: Vec::new(),
        }
    }

    /// Distinguished name of the entry.
    #[must_use]
    pub fn dn(&self) -> &str {
        &self.dn
    }

    /// Replaces the distinguished name.
    pub fn set_dn(&mut self, dn: impl Into<String>) {
        self.dn = dn.into();
    }

    /// Adds an attribute, replacing any attribute with the same name.
    pub fn add_attribute(&mut self, attribute: Attribute) {
        match self.position(attribute.name()) {
            Some(index) => self.attributes[index] = attribute,
            None => self.attributes.push(attribute),
        }
    }

    /// Adds an attribute from its map projection.
    pub fn add_value(&mut self, name: impl Into<String>, value: impl Into<MapValue>) {
        self.add_attribute(Attribute::from_map_value(name, value.into()));
    }

    /// Builder-style variant of [`Entry::add_attribute`].
    #[must_use]
    pub fn with_attribute(mut self, attribute: Attribute) -> Self {
        self.add_attribute(attribute);
        self
    }

    /// Looks an attribute up by name, ignoring case.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.position(name).map(|index| &self.attributes[index])
    }

    /// Mutable lookup by name, ignoring case.
    pub fn attribute_mut(&mut self, name: &str) -> Option<&mut Attribute> {
        self.position(name).map(move |index| &mut self.attributes[index])
    }

    /// Removes and returns the named attribute.
    pub fn remove_attribute(&mut self, name: &str) -> Option<Attribute> {
        self.position(name).map(|index| self.attributes.remove(index))
    }

    /// Attributes in insertion order.
    pub fn attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter()
    }

    /// Number of attributes.
    #[must_use]
    pub fn attribute_count(&self) -> usize {
        self.attributes.len()
    }

    /// Drops every attribute, keeping the DN.
    pub fn reset_attributes(&mut self) {
        self.attributes.clear();
    }

    /// Consumes the entry, returning its attributes.
    #[must_use]
    pub fn into_attributes(self) -> Vec<Attribute> {
        self.attributes
    }

    /// Projects the entry to a map: the DN under [`MAP_DN_KEY`], scalars for single-valued
    /// attributes and collections for multi-valued ones.
    ///
    /// An attribute named exactly [`MAP_DN_KEY`] cannot be represented and is left out.
    #[must_use]
    pub fn to_map(&self) -> EntryMap {
        let mut map = EntryMap::new();
        map.insert(MAP_DN_KEY.to_string(), MapValue::from(self.dn.clone()));
        for attribute in &self.attributes {
            if attribute.name() == MAP_DN_KEY {
                warn!(dn = %self.dn, "attribute `{MAP_DN_KEY}` clashes with the DN key, skipped");
                continue;
            }
            map.insert(attribute.name().to_string(), attribute.to_map_value());
        }
        map
    }

    /// Rebuilds an entry from its map projection.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ErrorKind::InvalidInput`] when the map has no textual, non-blank DN.
    pub fn from_map(map: EntryMap) -> Result<Self> {
        Self::from_map_with_dn(None, map)
    }

    /// Rebuilds an entry from a map, letting a non-blank `dn` override the map's DN.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ErrorKind::InvalidInput`] when neither `dn` nor the map supplies a
    /// non-blank DN, or when the map's DN is not text.
    pub fn from_map_with_dn(dn: Option<&str>, mut map: EntryMap) -> Result<Self> {
        let map_dn = match map.remove(MAP_DN_KEY) {
            None => None,
            Some(MapValue::Single(AttributeValue::Text(text))) => Some(text),
            Some(_) => {
                return Err(Error::invalid_input(format!(
                    "map key `{MAP_DN_KEY}` must hold a single text value"
                )))
            }
        };

        let dn = match dn.filter(|candidate| !candidate.trim().is_empty()) {
            Some(explicit) => explicit.to_string(),
            None => map_dn
                .filter(|candidate| !candidate.trim().is_empty())
                .ok_or_else(|| Error::invalid_input("entry DN is missing or blank"))?,
        };

        let mut entry = Self::new(dn);
        for (name, value) in map {
            entry.add_attribute(Attribute::from_map_value(name, value));
        }
        Ok(entry)
    }

    /// Returns true when both entries have the same DN and the same attributes, comparing
    /// values as sets.
    #[must_use]
    pub fn equivalent(&self, other: &Self) -> bool {
        self.dn == other.dn
            && self.attribute_count() == other.attribute_count()
            && self.attributes.iter().all(|attribute| {
                other
                    .attribute(attribute.name())
                    .is_some_and(|candidate| attribute.same_values(candidate))
            })
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.attributes
            .iter()
            .position(|attribute| attribute.name().eq_ignore_ascii_case(name))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.dn == other.dn
    }
}

impl Eq for Entry {}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_ldif())
    }
}

impl From<Entry> for EntryMap {
    fn from(entry: Entry) -> Self {
        entry.to_map()
    }
}

impl TryFrom<EntryMap> for Entry {
    type Error = Error;

    fn try_from(map: EntryMap) -> Result<Self> {
        Self::from_map(map)
    }
}
