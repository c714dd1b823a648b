// src/models/schema.rs
//! Parsed credential schemas.
//!
//! Only the parts of a JSON Schema the claim codec needs are extracted:
//! attribute types under `properties.credentialSubject.properties`, the
//! required list, and the optional `$metadata.serialization` slot mapping
//! that selects non-merklized encoding.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, thiserror::Error)]
pub enum SchemaError {
    #[error("schema unavailable: {0}")]
    Unavailable(String),
    #[error("schema fetch failed with transient error: {0}")]
    Transient(String),
    #[error("invalid schema: {0}")]
    Invalid(String),
    #[error("unsupported schema URL scheme: {0}")]
    UnsupportedScheme(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    String,
    Integer,
    Boolean,
    /// JSON `number`; only integral values are encodable.
    Number,
    /// `string` with `contentEncoding: base64`.
    Bytes,
}

/// Attribute names bound to the four data slots of a non-merklized claim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotSerialization {
    pub index_data_slot_a: Option<String>,
    pub index_data_slot_b: Option<String>,
    pub value_data_slot_a: Option<String>,
    pub value_data_slot_b: Option<String>,
}

impl SlotSerialization {
    pub fn attributes(&self) -> impl Iterator<Item = &String> {
        [&self.index_data_slot_a, &self.index_data_slot_b, &self.value_data_slot_a, &self.value_data_slot_b]
            .into_iter()
            .flatten()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    pub url: String,
    /// Hex Keccak-256 of the raw schema document.
    pub digest: String,
    pub json_schema: Value,
    pub json_ld_context: Option<Value>,
    pub attributes: BTreeMap<String, AttributeType>,
    pub required: BTreeSet<String>,
    pub serialization: Option<SlotSerialization>,
}

impl Schema {
    pub fn parse(url: &str, digest: String, json_schema: Value, json_ld_context: Option<Value>) -> Result<Self, SchemaError> {
        let subject = json_schema
            .pointer("/properties/credentialSubject")
            .ok_or_else(|| SchemaError::Invalid(format!("{}: missing properties.credentialSubject", url)))?;

        let mut attributes = BTreeMap::new();
        if let Some(props) = subject.get("properties").and_then(Value::as_object) {
            for (name, spec) in props {
                if name == "id" {
                    continue;
                }
                attributes.insert(name.clone(), attribute_type(url, name, spec)?);
            }
        }

        let required = subject
            .get("required")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .filter(|name| *name != "id")
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let serialization = match json_schema.pointer("/$metadata/serialization") {
            Some(value) => {
                let slots: SlotSerialization = serde_json::from_value(value.clone())
                    .map_err(|e| SchemaError::Invalid(format!("{}: bad serialization block: {}", url, e)))?;
                if let Some(unknown) = slots.attributes().find(|a| !attributes.contains_key(*a)) {
                    return Err(SchemaError::Invalid(format!("{}: slot bound to unknown attribute '{}'", url, unknown)));
                }
                Some(slots)
            }
            None => None,
        };

        Ok(Self {
            url: url.to_string(),
            digest,
            json_schema,
            json_ld_context,
            attributes,
            required,
            serialization,
        })
    }

    /// `$metadata.uris.jsonLdContext`, if the schema names one.
    pub fn context_uri(json_schema: &Value) -> Option<String> {
        json_schema
            .pointer("/$metadata/uris/jsonLdContext")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn is_merklized(&self) -> bool {
        self.serialization.is_none()
    }
}

fn attribute_type(url: &str, name: &str, spec: &Value) -> Result<AttributeType, SchemaError> {
    let kind = spec.get("type").and_then(Value::as_str).unwrap_or_default();
    match kind {
        "string" if spec.get("contentEncoding").and_then(Value::as_str) == Some("base64") => Ok(AttributeType::Bytes),
        "string" => Ok(AttributeType::String),
        "integer" => Ok(AttributeType::Integer),
        "number" => Ok(AttributeType::Number),
        "boolean" => Ok(AttributeType::Boolean),
        other => Err(SchemaError::Invalid(format!("{}: attribute '{}' has unsupported type '{}'", url, name, other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn age_schema() -> Value {
        json!({
            "$metadata": { "uris": { "jsonLdContext": "https://schemas.example/age.jsonld" } },
            "properties": {
                "credentialSubject": {
                    "properties": {
                        "id": { "type": "string", "format": "uri" },
                        "birthday": { "type": "integer" },
                        "nickname": { "type": "string" },
                        "photo": { "type": "string", "contentEncoding": "base64" }
                    },
                    "required": ["id", "birthday"]
                }
            }
        })
    }

    #[test]
    fn test_parse_attributes() {
        let schema = Schema::parse("u", "d".into(), age_schema(), None).unwrap();
        assert_eq!(schema.attributes.get("birthday"), Some(&AttributeType::Integer));
        assert_eq!(schema.attributes.get("photo"), Some(&AttributeType::Bytes));
        assert!(!schema.attributes.contains_key("id"));
        assert!(schema.required.contains("birthday"));
        assert!(!schema.required.contains("id"));
        assert!(schema.is_merklized());
        assert_eq!(Schema::context_uri(&schema.json_schema).as_deref(), Some("https://schemas.example/age.jsonld"));
    }

    #[test]
    fn test_parse_serialization_slots() {
        let mut raw = age_schema();
        raw["$metadata"]["serialization"] = json!({ "indexDataSlotA": "birthday" });
        let schema = Schema::parse("u", "d".into(), raw, None).unwrap();
        assert!(!schema.is_merklized());

        let mut raw = age_schema();
        raw["$metadata"]["serialization"] = json!({ "valueDataSlotA": "unknown" });
        assert!(matches!(Schema::parse("u", "d".into(), raw, None), Err(SchemaError::Invalid(_))));
    }

    #[test]
    fn test_missing_subject_is_invalid() {
        assert!(Schema::parse("u", "d".into(), json!({"properties": {}}), None).is_err());
    }
}
