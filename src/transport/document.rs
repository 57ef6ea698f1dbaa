//! API-description (Swagger 2.0 JSON) document merging.
//!
//! # Merge rules
//! - `paths` are merged per path and per method; a later document
//!   overrides an earlier operation with the same path and method
//! - `definitions` are merged by schema name; later wins
//! - any other top-level field keeps the value of the first document that
//!   set it
//! - every override is logged at `warn`

use bytes::Bytes;
use serde_json::{Map, Value};
use thiserror::Error;

/// Error type for document parsing and merging.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Malformed document: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("Document is not a JSON object")]
    NotAnObject,

    #[error("Document section {section:?} is not an object")]
    InvalidSection { section: String },

    #[error("Failed to serialize document: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// A parsed document, split into the sections the merger cares about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentSet {
    /// path -> (method -> operation)
    pub paths: Map<String, Value>,
    /// schema name -> schema
    pub definitions: Map<String, Value>,
    /// Every other top-level field.
    pub rest: Map<String, Value>,
}

impl DocumentSet {
    pub fn parse(raw: &[u8]) -> Result<Self, DocumentError> {
        let value: Value = serde_json::from_slice(raw).map_err(DocumentError::Parse)?;
        let Value::Object(mut root) = value else {
            return Err(DocumentError::NotAnObject);
        };

        let paths = take_object(&mut root, "paths")?;
        for (path, operations) in &paths {
            if !operations.is_object() {
                return Err(DocumentError::InvalidSection {
                    section: format!("paths.{path}"),
                });
            }
        }
        let definitions = take_object(&mut root, "definitions")?;

        Ok(Self {
            paths,
            definitions,
            rest: root,
        })
    }

    pub fn to_bytes(&self) -> Result<Bytes, DocumentError> {
        let mut root = self.rest.clone();
        root.entry("swagger")
            .or_insert_with(|| Value::String("2.0".to_string()));
        root.insert("paths".to_string(), Value::Object(self.paths.clone()));
        root.insert(
            "definitions".to_string(),
            Value::Object(self.definitions.clone()),
        );
        serde_json::to_vec(&Value::Object(root))
            .map(Bytes::from)
            .map_err(DocumentError::Serialize)
    }

    /// `(path, method)` pairs of every operation.
    pub fn operations(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for (path, operations) in &self.paths {
            if let Some(operations) = operations.as_object() {
                for method in operations.keys() {
                    out.push((path.clone(), method.clone()));
                }
            }
        }
        out
    }

    fn absorb(&mut self, other: DocumentSet) {
        for (path, operations) in other.paths {
            let Value::Object(operations) = operations else {
                continue;
            };
            let entry = self
                .paths
                .entry(path.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            // Paths are validated as objects on parse.
            let Some(existing) = entry.as_object_mut() else {
                continue;
            };
            for (method, operation) in operations {
                if existing.insert(method.clone(), operation).is_some() {
                    tracing::warn!(path = %path, method = %method, "Duplicate operation, later document wins");
                }
            }
        }

        for (name, schema) in other.definitions {
            if self.definitions.insert(name.clone(), schema).is_some() {
                tracing::warn!(definition = %name, "Duplicate definition, later document wins");
            }
        }

        for (key, value) in other.rest {
            self.rest.entry(key).or_insert(value);
        }
    }
}

fn take_object(root: &mut Map<String, Value>, section: &str) -> Result<Map<String, Value>, DocumentError> {
    match root.remove(section) {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map),
        Some(_) => Err(DocumentError::InvalidSection {
            section: section.to_string(),
        }),
    }
}

/// Accumulates documents and unions them.
#[derive(Debug, Default)]
pub struct DocumentMerger {
    merged: DocumentSet,
    sources: usize,
}

impl DocumentMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and fold in one raw document. Empty input is skipped.
    pub fn add_definition(&mut self, raw: &[u8]) -> Result<(), DocumentError> {
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }
        let set = DocumentSet::parse(raw)?;
        self.merged.absorb(set);
        self.sources += 1;
        Ok(())
    }

    /// Number of non-empty documents folded in so far.
    pub fn sources(&self) -> usize {
        self.sources
    }

    pub fn merged(&self) -> &DocumentSet {
        &self.merged
    }

    /// Serialize the union of everything added.
    pub fn sum_definitions(&self) -> Result<Bytes, DocumentError> {
        self.merged.to_bytes()
    }
}
