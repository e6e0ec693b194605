// 📐 Account Schema - shape of the emitted accounts for connector runtimes
// Describes and validates the attributes every MergedAccount is exported with

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::entities::MergedAccount;

// ============================================================================
// SCHEMA TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeKind {
    String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaAttribute {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AttributeKind,
    pub description: String,
    #[serde(rename = "multi")]
    pub multi_valued: bool,
    pub entitlement: bool,
    pub managed: bool,
}

impl SchemaAttribute {
    fn single(name: &str, description: &str) -> Self {
        SchemaAttribute {
            name: name.to_string(),
            kind: AttributeKind::String,
            description: description.to_string(),
            multi_valued: false,
            entitlement: false,
            managed: false,
        }
    }

    fn multi(name: &str, description: &str) -> Self {
        SchemaAttribute {
            multi_valued: true,
            ..Self::single(name, description)
        }
    }

    fn entitlement(mut self) -> Self {
        self.entitlement = true;
        self.managed = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSchema {
    pub native_object_type: String,
    pub identity_attribute: String,
    pub display_attribute: String,
    pub attributes: Vec<SchemaAttribute>,
}

impl AccountSchema {
    pub fn attribute(&self, name: &str) -> Option<&SchemaAttribute> {
        self.attributes.iter().find(|a| a.name == name)
    }
}

/// Schema of every account a pass emits
pub fn account_schema() -> AccountSchema {
    AccountSchema {
        native_object_type: "account".to_string(),
        identity_attribute: "id".to_string(),
        display_attribute: "name".to_string(),
        attributes: vec![
            SchemaAttribute::single("id", "Identity key"),
            SchemaAttribute::single("name", "Display name"),
            SchemaAttribute::single("source", "Source the identity was found in"),
            SchemaAttribute::multi("history", "Chronological audit trail"),
            SchemaAttribute::multi("status", "Reconciliation status tags").entitlement(),
            SchemaAttribute::multi("reviews", "Outstanding review cases").entitlement(),
        ],
    }
}

/// Export an account as a flat attribute map matching `account_schema()`
pub fn to_attributes(account: &MergedAccount) -> Map<String, Value> {
    let mut attributes = Map::new();
    attributes.insert("id".into(), json!(account.id));
    attributes.insert(
        "name".into(),
        json!(account.display_name.as_deref().unwrap_or(&account.id)),
    );
    if let Some(source) = &account.source {
        attributes.insert("source".into(), json!(source));
    }
    attributes.insert("history".into(), json!(account.history));
    attributes.insert(
        "status".into(),
        json!(account.status.iter().map(|s| s.as_str()).collect::<Vec<_>>()),
    );
    attributes.insert("reviews".into(), json!(account.reviews));
    attributes
}

// ============================================================================
// VALIDATION
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

pub type ValidationResult = Result<(), Vec<ValidationError>>;

/// Check an exported attribute map against the schema
///
/// Single-valued attributes must be strings, multi-valued ones arrays of
/// strings, and no attribute outside the schema may appear.
pub fn validate_attributes(schema: &AccountSchema, attributes: &Map<String, Value>) -> ValidationResult {
    let mut errors = Vec::new();

    match attributes.get(&schema.identity_attribute) {
        Some(Value::String(id)) if !id.is_empty() => {}
        _ => errors.push(ValidationError {
            field: schema.identity_attribute.clone(),
            message: "Required field is empty".to_string(),
        }),
    }

    for (name, value) in attributes {
        let Some(attribute) = schema.attribute(name) else {
            errors.push(ValidationError {
                field: name.clone(),
                message: "Not part of the account schema".to_string(),
            });
            continue;
        };

        let well_typed = if attribute.multi_valued {
            value
                .as_array()
                .map(|items| items.iter().all(Value::is_string))
                .unwrap_or(false)
        } else {
            value.is_string()
        };
        if !well_typed {
            errors.push(ValidationError {
                field: name.clone(),
                message: if attribute.multi_valued {
                    "Expected a list of strings".to_string()
                } else {
                    "Expected a string".to_string()
                },
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::AccountStatus;

    #[test]
    fn test_schema_flags() {
        let schema = account_schema();

        assert_eq!(schema.identity_attribute, "id");
        assert!(!schema.attribute("id").unwrap().multi_valued);
        assert!(schema.attribute("history").unwrap().multi_valued);
        assert!(!schema.attribute("history").unwrap().entitlement);
        assert!(schema.attribute("status").unwrap().entitlement);
        assert!(schema.attribute("reviews").unwrap().entitlement);
    }

    #[test]
    fn test_schema_serializes_for_connectors() {
        let json = serde_json::to_value(account_schema()).unwrap();

        assert_eq!(json["attributes"][4]["name"], "status");
        assert_eq!(json["attributes"][4]["type"], "string");
        assert_eq!(json["attributes"][4]["multi"], true);
    }

    #[test]
    fn test_exported_account_is_valid() {
        let mut account = MergedAccount::new("jdoe")
            .with_status(AccountStatus::Manual)
            .with_status(AccountStatus::Reviewer);
        account.reviews.insert("abc".into());

        let attributes = to_attributes(&account);

        assert_eq!(attributes["name"], "jdoe");
        assert_eq!(attributes["status"], json!(["manual", "reviewer"]));
        assert!(!attributes.contains_key("source"));
        assert!(validate_attributes(&account_schema(), &attributes).is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_and_mistyped() {
        let mut attributes = Map::new();
        attributes.insert("id".into(), json!(""));
        attributes.insert("status".into(), json!("auto"));
        attributes.insert("department".into(), json!("Sales"));

        let errors = validate_attributes(&account_schema(), &attributes).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();

        assert!(fields.contains(&"id"));
        assert!(fields.contains(&"status"));
        assert!(fields.contains(&"department"));
    }
}
