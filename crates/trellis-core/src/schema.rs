//! Node input/output schemas.
//!
//! Registered nodes declare their inputs and outputs as a flat
//! JSON-schema-shaped object: named properties with a type tag. The state
//! manager only routes string scalars, so validation boils down to
//! presence and string-typedness checks.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("field {0} is missing from the output")]
    MissingField(String),
}

/// One declared property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    #[serde(rename = "type")]
    pub kind: String,
}

/// Flat object schema: property name -> type tag, plus the conventional
/// JSON-schema envelope fields so runtime-submitted schemas round-trip.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSchema {
    #[serde(rename = "type", default = "object_tag")]
    pub kind: String,
    #[serde(default)]
    pub properties: BTreeMap<String, Property>,
    #[serde(default)]
    pub required: Vec<String>,
}

fn object_tag() -> String {
    "object".to_string()
}

impl NodeSchema {
    /// Build a schema where every named field is a required string.
    pub fn strings<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut properties = BTreeMap::new();
        let mut required = Vec::new();
        for field in fields {
            let field = field.into();
            properties.insert(
                field.clone(),
                Property {
                    kind: "string".to_string(),
                },
            );
            required.push(field);
        }
        Self {
            kind: object_tag(),
            properties,
            required,
        }
    }

    /// Declared field names, in lexicographic order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.properties.keys().map(String::as_str)
    }

    /// Whether the schema declares `field` at all.
    pub fn has_field(&self, field: &str) -> bool {
        self.properties.contains_key(field)
    }

    /// Whether `field` is declared as a string scalar.
    pub fn is_string_field(&self, field: &str) -> bool {
        self.properties
            .get(field)
            .is_some_and(|p| p.kind == "string")
    }

    /// Validate a committed output map: every declared field must be
    /// present. Extra fields are allowed and passed through.
    pub fn validate_output(&self, output: &BTreeMap<String, String>) -> Result<(), SchemaError> {
        for field in self.properties.keys() {
            if !output.contains_key(field) {
                return Err(SchemaError::MissingField(field.clone()));
            }
        }
        Ok(())
    }
}
