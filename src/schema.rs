//! External schema validator registry.
//!
//! The core treats schemas as opaque: a registered validator is a pure
//! function from bytes to pass/fail-with-messages. Validator source and
//! format are someone else's concern. An unregistered schema id validates as
//! a pass-through.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A pure validation function over artifact bytes.
pub trait SchemaValidator: Send + Sync {
    /// `Ok(())` when the bytes conform; otherwise the list of messages.
    fn validate(&self, bytes: &[u8]) -> Result<(), Vec<String>>;
}

impl<F> SchemaValidator for F
where
    F: Fn(&[u8]) -> Result<(), Vec<String>> + Send + Sync,
{
    fn validate(&self, bytes: &[u8]) -> Result<(), Vec<String>> {
        self(bytes)
    }
}

/// Validates that the payload is a JSON object carrying a set of keys.
/// The simplest useful built-in; real deployments register richer validators.
pub struct RequiredKeysValidator {
    keys: Vec<String>,
}

impl RequiredKeysValidator {
    pub fn new(keys: &[&str]) -> Self {
        Self {
            keys: keys.iter().map(|k| k.to_string()).collect(),
        }
    }
}

impl SchemaValidator for RequiredKeysValidator {
    fn validate(&self, bytes: &[u8]) -> Result<(), Vec<String>> {
        let value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|err| vec![format!("not valid JSON: {err}")])?;
        let object = value
            .as_object()
            .ok_or_else(|| vec!["expected a JSON object".to_string()])?;
        let missing: Vec<String> = self
            .keys
            .iter()
            .filter(|key| !object.contains_key(key.as_str()))
            .map(|key| format!("missing required key '{key}'"))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(missing)
        }
    }
}

/// Registry of schema validators keyed by schema id.
#[derive(Default)]
pub struct SchemaRegistry {
    validators: RwLock<HashMap<String, Arc<dyn SchemaValidator>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, schema_id: &str, validator: Arc<dyn SchemaValidator>) {
        let mut validators = match self.validators.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        validators.insert(schema_id.to_string(), validator);
    }

    /// Validate bytes against a schema id. Unknown ids pass.
    pub fn validate(&self, schema_id: &str, bytes: &[u8]) -> Result<(), Vec<String>> {
        let validator = {
            let validators = match self.validators.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            validators.get(schema_id).cloned()
        };
        match validator {
            Some(validator) => validator.validate(bytes),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_schema_passes() {
        let registry = SchemaRegistry::new();
        assert!(registry.validate("nothing.registered", b"not even json").is_ok());
    }

    #[test]
    fn required_keys_validator_accepts_conforming_object() {
        let registry = SchemaRegistry::new();
        registry.register(
            "plan.out",
            Arc::new(RequiredKeysValidator::new(&["milestones", "owner"])),
        );
        let bytes = br#"{"milestones": [], "owner": "planner"}"#;
        assert!(registry.validate("plan.out", bytes).is_ok());
    }

    #[test]
    fn required_keys_validator_reports_missing_keys() {
        let registry = SchemaRegistry::new();
        registry.register(
            "plan.out",
            Arc::new(RequiredKeysValidator::new(&["milestones"])),
        );
        let err = registry.validate("plan.out", br#"{"owner": "x"}"#).unwrap_err();
        assert_eq!(err.len(), 1);
        assert!(err[0].contains("milestones"));
    }

    #[test]
    fn non_json_is_rejected() {
        let registry = SchemaRegistry::new();
        registry.register("s", Arc::new(RequiredKeysValidator::new(&["k"])));
        assert!(registry.validate("s", b"garbage").is_err());
    }

    #[test]
    fn closures_are_validators() {
        let registry = SchemaRegistry::new();
        registry.register(
            "always.fails",
            Arc::new(|_bytes: &[u8]| Err(vec!["nope".to_string()])),
        );
        assert!(registry.validate("always.fails", b"{}").is_err());
    }
}
