// 🪪 Record Entity - immutable snapshot of one identity or account entry
//
// "The key is IDENTITY, the attribute map is a VALUE taken at the start of a pass"

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

// ============================================================================
// RECORD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Stable identifier
    pub key: String,

    /// Human-readable name (falls back to key when empty)
    #[serde(default)]
    pub display_name: String,

    /// System of record this entry came from
    #[serde(default)]
    pub source: String,

    /// Attribute values; the configured subset is used for matching
    #[serde(default)]
    pub attributes: HashMap<String, Value>,

    /// Already present in the authoritative output
    #[serde(default)]
    pub resolved: bool,
}

impl Record {
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        Record {
            display_name: key.clone(),
            key,
            source: String::new(),
            attributes: HashMap::new(),
            resolved: false,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn resolved(mut self, resolved: bool) -> Self {
        self.resolved = resolved;
        self
    }

    /// Display name, or the key when no name was captured
    pub fn name(&self) -> &str {
        if self.display_name.is_empty() {
            &self.key
        } else {
            &self.display_name
        }
    }

    /// Attribute value, treating JSON null as absent
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name).filter(|v| !v.is_null())
    }

    /// Attribute rendered as text for similarity scoring
    ///
    /// Strings are used verbatim; other JSON values use their JSON text.
    pub fn attribute_text(&self, name: &str) -> Option<String> {
        self.attribute(name).map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// Projection of the given attributes (absent ones are omitted)
    ///
    /// Two records are identical for matching purposes when their
    /// projections are structurally equal.
    pub fn projection<'a>(&'a self, names: &'a [String]) -> BTreeMap<&'a str, &'a Value> {
        names
            .iter()
            .filter_map(|name| self.attribute(name).map(|v| (name.as_str(), v)))
            .collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_builder() {
        let record = Record::new("jdoe")
            .with_display_name("John Doe")
            .with_source("HR")
            .with_attribute("uid", "jdoe");

        assert_eq!(record.key, "jdoe");
        assert_eq!(record.name(), "John Doe");
        assert_eq!(record.source, "HR");
        assert_eq!(record.attribute("uid"), Some(&json!("jdoe")));
        assert!(!record.resolved);
    }

    #[test]
    fn test_name_falls_back_to_key() {
        let record = Record::new("jdoe").with_display_name("");
        assert_eq!(record.name(), "jdoe");
    }

    #[test]
    fn test_null_attribute_is_absent() {
        let record = Record::new("jdoe").with_attribute("email", Value::Null);

        assert!(record.attribute("email").is_none());
        assert!(record.attribute_text("email").is_none());
    }

    #[test]
    fn test_attribute_text_for_non_strings() {
        let record = Record::new("jdoe")
            .with_attribute("employee_no", 4521)
            .with_attribute("active", true);

        assert_eq!(record.attribute_text("employee_no").as_deref(), Some("4521"));
        assert_eq!(record.attribute_text("active").as_deref(), Some("true"));
    }

    #[test]
    fn test_projection_omits_missing() {
        let names = vec!["uid".to_string(), "email".to_string()];
        let a = Record::new("a").with_attribute("uid", "jdoe");
        let b = Record::new("b")
            .with_attribute("uid", "jdoe")
            .with_attribute("department", "Sales");

        let projection = a.projection(&names);
        assert_eq!(projection.len(), 1);
        assert_eq!(projection, b.projection(&names));
    }
}
