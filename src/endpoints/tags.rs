use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum TagError {
    #[error("Group {group} entry {index} must hold exactly one sub-field, found {found}")]
    GroupEntryShape { group: String, index: usize, found: usize },
    #[error("Tag {0} has an empty element name")]
    EmptyElement(String),
}

fn entity_type_default() -> String { return "sensor".to_string() }

/// Discovery metadata of one sensor. Everything besides `entity_type` is
/// handed through to the discovery payload untouched.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct SensorDetails {
    #[serde(default="entity_type_default")]
    pub entity_type: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for SensorDetails {
    fn default() -> Self {
        return SensorDetails { entity_type: entity_type_default(), extra: serde_json::Map::new() }
    }
}

/// One extractable element together with its discovery metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct LeafTag {
    pub element: String,
    pub details: SensorDetails,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TagSpec {
    Leaf(LeafTag),
    Group(Vec<(String, LeafTag)>),
}

/// Tags of one endpoint, keyed by logical field name.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TagSet {
    entries: Vec<(String, TagSpec)>,
}

/// A flattened leaf: the reading key it produces and what to look for.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorField<'a> {
    pub key: String,
    pub tag: &'a LeafTag,
}

impl TagSet {
    pub fn new(entries: Vec<(String, TagSpec)>) -> Self {
        return TagSet { entries }
    }

    /// Plain leaves only, mapping field name to element name.
    pub fn flat<I, K, V>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let entries = fields.into_iter()
            .map(|(k, v)| (k.into(), TagSpec::Leaf(LeafTag { element: v.into(), details: SensorDetails::default() })))
            .collect();
        return TagSet { entries }
    }

    pub fn entries(&self) -> &[(String, TagSpec)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every leaf with its reading key. Grouped sub-fields are keyed
    /// `<group><sub>` so equal sub-field names in two groups stay apart.
    pub fn fields(&self) -> Vec<SensorField<'_>> {
        let mut out = Vec::new();
        for (name, spec) in &self.entries {
            match spec {
                TagSpec::Leaf(tag) => out.push(SensorField { key: name.clone(), tag }),
                TagSpec::Group(members) => {
                    for (sub, tag) in members {
                        out.push(SensorField { key: format!("{name}{sub}"), tag });
                    }
                }
            }
        }
        out
    }
}

#[derive(Deserialize, Debug, Clone)]
pub(crate) struct RawDetails {
    #[serde(default)]
    element: Option<String>,
    #[serde(flatten)]
    details: SensorDetails,
}

/// The three spellings a tag may take in an endpoint document.
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub(crate) enum RawTag {
    Element(String),
    Group(Vec<BTreeMap<String, RawDetails>>),
    Detailed(RawDetails),
}

impl RawTag {
    pub(crate) fn resolve(self, name: &str) -> Result<TagSpec, TagError> {
        match self {
            RawTag::Element(element) => {
                if element.trim().is_empty() {
                    return Err(TagError::EmptyElement(name.to_string()));
                }
                Ok(TagSpec::Leaf(LeafTag { element, details: SensorDetails::default() }))
            }
            RawTag::Detailed(raw) => Ok(TagSpec::Leaf(raw.into_leaf(name)?)),
            RawTag::Group(items) => {
                let mut members = Vec::with_capacity(items.len());
                for (index, item) in items.into_iter().enumerate() {
                    if item.len() != 1 {
                        return Err(TagError::GroupEntryShape { group: name.to_string(), index, found: item.len() });
                    }
                    for (sub, raw) in item {
                        let leaf = raw.into_leaf(&sub)?;
                        members.push((sub, leaf));
                    }
                }
                Ok(TagSpec::Group(members))
            }
        }
    }
}

impl RawDetails {
    /// Without an explicit `element`, the key itself names the element.
    fn into_leaf(self, key: &str) -> Result<LeafTag, TagError> {
        let element = self.element.unwrap_or_else(|| key.to_string());
        if element.trim().is_empty() {
            return Err(TagError::EmptyElement(key.to_string()));
        }
        Ok(LeafTag { element, details: self.details })
    }
}

/// Tag entries of one endpoint in the order the document lists them.
#[derive(Debug, Clone, Default)]
pub(crate) struct RawTags(Vec<(String, RawTag)>);

impl<'de> Deserialize<'de> for RawTags {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TagsVisitor;

        impl<'de> Visitor<'de> for TagsVisitor {
            type Value = RawTags;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of tag names to elements")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<RawTags, A::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((name, tag)) = map.next_entry::<String, RawTag>()? {
                    entries.push((name, tag));
                }
                Ok(RawTags(entries))
            }
        }

        deserializer.deserialize_map(TagsVisitor)
    }
}

pub(crate) fn resolve_tags(raw: RawTags) -> Result<TagSet, TagError> {
    let mut entries = Vec::with_capacity(raw.0.len());
    for (name, tag) in raw.0 {
        let spec = tag.resolve(&name)?;
        entries.push((name, spec));
    }
    Ok(TagSet::new(entries))
}
