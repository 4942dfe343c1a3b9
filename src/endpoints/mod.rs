pub mod tags;

use log::{debug, info};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use tags::{LeafTag, SensorDetails, SensorField, TagError, TagSet, TagSpec};
use tags::{resolve_tags, RawTags};

/// Firmware release that serves the alternate resource tree.
pub const LEGACY_FIRMWARE: &str = "3.2.39";

const DEFAULT_DOCUMENT: &str = include_str!("../../configs/endpoints_default.yaml");
const LEGACY_DOCUMENT: &str = include_str!("../../configs/endpoints_3_2_39.yaml");

#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("Unable to read endpoint document {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("Unable to parse endpoint document: {0}")]
    Parse(#[from] serde_yml::Error),
    #[error("Record {index} must hold exactly one endpoint, found {found}")]
    RecordShape { index: usize, found: usize },
    #[error("Endpoint {name}: {source}")]
    Tag { name: String, source: TagError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointVariant {
    Default,
    V3_2_39,
}

impl EndpointVariant {
    /// Exact match only, "3.2.39 " or "3.2.390" get the default tree.
    pub fn for_firmware(sw_version: &str) -> Self {
        if sw_version == LEGACY_FIRMWARE {
            EndpointVariant::V3_2_39
        } else {
            EndpointVariant::Default
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            EndpointVariant::Default => "endpoints_default.yaml",
            EndpointVariant::V3_2_39 => "endpoints_3_2_39.yaml",
        }
    }

    fn builtin(&self) -> &'static str {
        match self {
            EndpointVariant::Default => DEFAULT_DOCUMENT,
            EndpointVariant::V3_2_39 => LEGACY_DOCUMENT,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
struct RawEndpoint {
    url: String,
    tags: RawTags,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EndpointDefinition {
    pub name: String,
    pub path: String,
    pub tags: TagSet,
}

/// Ordered endpoint definitions, tags already resolved.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EndpointDocument {
    pub definitions: Vec<EndpointDefinition>,
}

impl EndpointDocument {
    pub fn from_yaml(contents: &str) -> Result<Self, EndpointError> {
        let records: Vec<BTreeMap<String, RawEndpoint>> = serde_yml::from_str(contents)?;
        let mut definitions = Vec::with_capacity(records.len());

        for (index, record) in records.into_iter().enumerate() {
            if record.len() != 1 {
                return Err(EndpointError::RecordShape { index, found: record.len() });
            }
            for (name, raw) in record {
                let tags = resolve_tags(raw.tags)
                    .map_err(|source| EndpointError::Tag { name: name.clone(), source })?;
                definitions.push(EndpointDefinition { name, path: raw.url, tags });
            }
        }

        Ok(EndpointDocument { definitions })
    }

    /// `<dir>/endpoints_<variant>.yaml` when a directory is given, the
    /// built-in copy otherwise.
    pub fn load(variant: EndpointVariant, dir: Option<&Path>) -> Result<Self, EndpointError> {
        match dir {
            Some(dir) => {
                let path = dir.join(variant.file_name());
                info!("Loading endpoints from {}", path.display());
                let contents = fs::read_to_string(&path)
                    .map_err(|source| EndpointError::Io { path: path.clone(), source })?;
                Self::from_yaml(&contents)
            }
            None => {
                debug!("Using built-in {}", variant.file_name());
                Self::from_yaml(variant.builtin())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EndpointSpec {
    pub name: String,
    pub path: String,
    pub url: String,
    pub tags: TagSet,
}

/// One spec per record, in document order. No network access.
pub fn build(document: &EndpointDocument, base_url: &str) -> Vec<EndpointSpec> {
    let base = base_url.trim_end_matches('/');
    document.definitions.iter()
        .map(|d| EndpointSpec {
            name: d.name.clone(),
            path: d.path.clone(),
            url: format!("{base}{}", d.path),
            tags: d.tags.clone(),
        })
        .collect()
}
