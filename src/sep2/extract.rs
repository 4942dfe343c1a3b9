use std::collections::BTreeMap;
use roxmltree::{Document, Node};
use thiserror::Error;

use crate::endpoints::TagSet;
use super::IEEE_NS;

/// Field name to raw text, one per endpoint and poll.
pub type ReadingResult = BTreeMap<String, String>;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Malformed XML: {0}")]
    Xml(#[from] roxmltree::Error),
}

/// First element below the root (document order) named `name` in the
/// 2030.5 namespace.
pub fn find_element<'a, 'input>(doc: &'a Document<'input>, name: &str) -> Option<Node<'a, 'input>> {
    doc.root_element()
        .descendants()
        .skip(1)
        .find(|n| n.is_element() && n.tag_name().name() == name && n.tag_name().namespace() == Some(IEEE_NS))
}

/// Pulls every leaf of `tags` out of `raw`. Leaves with no matching element
/// are left out of the result.
pub fn extract(raw: &str, tags: &TagSet) -> Result<ReadingResult, ExtractError> {
    let doc = Document::parse(raw)?;
    let mut reading = ReadingResult::new();

    for field in tags.fields() {
        if let Some(node) = find_element(&doc, &field.tag.element) {
            reading.insert(field.key, node.text().unwrap_or("").to_string());
        }
    }

    Ok(reading)
}
