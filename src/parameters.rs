//! Cluster parameter document
//!
//! The document passed from provider to provider. Slingshot treats it as
//! an open YAML mapping: providers add whatever keys they need, and the
//! only structure slingshot relies on is `general.cluster.name` and the
//! `inventory` list the infrastructure provider produces.

use crate::error::{ProvisionError, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

pub const INVENTORY_KEY: &str = "inventory";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterDocument(Value);

impl Default for ParameterDocument {
    fn default() -> Self {
        Self(Value::Mapping(Mapping::new()))
    }
}

impl ParameterDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a YAML mapping. Empty input yields an empty document.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        match parse_mapping(bytes)? {
            Some(value) => Ok(Self(value)),
            None => Ok(Self::default()),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_yaml::to_string(&self.0)?.into_bytes())
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Set a nested key, creating intermediate mappings and replacing any
    /// scalar in the way.
    pub fn set_path(&mut self, path: &[&str], value: Value) {
        let Some((last, parents)) = path.split_last() else {
            return;
        };

        let mut current = &mut self.0;
        for key in parents {
            if !current.is_mapping() {
                *current = Value::Mapping(Mapping::new());
            }
            let Value::Mapping(map) = current else {
                return;
            };
            current = map
                .entry(Value::from(*key))
                .or_insert_with(|| Value::Mapping(Mapping::new()));
        }

        if !current.is_mapping() {
            *current = Value::Mapping(Mapping::new());
        }
        if let Value::Mapping(map) = current {
            map.insert(Value::from(*last), value);
        }
    }

    /// Merge a provider's output document into this one.
    ///
    /// Mappings merge key by key with the output winning; any other value
    /// in the output replaces what was there. Empty output changes nothing.
    pub fn merge_bytes(&mut self, output: &[u8]) -> Result<()> {
        if let Some(overlay) = parse_mapping(output)? {
            merge_values(&mut self.0, overlay);
        }
        Ok(())
    }

    pub fn merge(&mut self, other: ParameterDocument) {
        merge_values(&mut self.0, other.0);
    }

    /// The inventory list, or an empty list if the document has none.
    pub fn inventory(&self) -> Value {
        match self.0.get(INVENTORY_KEY) {
            Some(Value::Null) | None => Value::Sequence(Vec::new()),
            Some(inventory) => inventory.clone(),
        }
    }

    /// Every structural problem, so the operator can fix them in one pass.
    pub fn validate(&self) -> Vec<ProvisionError> {
        let mut errors = Vec::new();

        if !self.0.is_mapping() {
            errors.push(ProvisionError::validation(
                "parameter document must be a mapping",
            ));
            return errors;
        }

        match self.0.get(INVENTORY_KEY) {
            None | Some(Value::Null) => {}
            Some(Value::Sequence(machines)) => {
                for (index, machine) in machines.iter().enumerate() {
                    validate_machine(index, machine, &mut errors);
                }
            }
            Some(_) => errors.push(ProvisionError::validation("inventory must be a list")),
        }

        errors
    }
}

fn validate_machine(index: usize, machine: &Value, errors: &mut Vec<ProvisionError>) {
    let label = match machine.get("name").and_then(Value::as_str) {
        Some(name) => format!("inventory[{}] ({})", index, name),
        None => format!("inventory[{}]", index),
    };

    if !machine.is_mapping() {
        errors.push(ProvisionError::validation(format!(
            "{} must be a mapping",
            label
        )));
        return;
    }

    let has_ip = machine
        .get("privateIP")
        .and_then(Value::as_str)
        .is_some_and(|ip| !ip.trim().is_empty());
    if !has_ip {
        errors.push(ProvisionError::validation(format!(
            "{}: privateIP is required",
            label
        )));
    }

    let has_role = machine
        .get("roles")
        .and_then(Value::as_sequence)
        .is_some_and(|roles| !roles.is_empty());
    if !has_role {
        errors.push(ProvisionError::validation(format!(
            "{}: at least one role is required",
            label
        )));
    }
}

/// Parse YAML that must be a mapping; `None` for empty or null input.
fn parse_mapping(bytes: &[u8]) -> Result<Option<Value>> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let value: Value = serde_yaml::from_slice(bytes)?;
    match value {
        Value::Null => Ok(None),
        Value::Mapping(_) => Ok(Some(value)),
        _ => Err(ProvisionError::parse("document must be a YAML mapping")),
    }
}

fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(yaml: &str) -> ParameterDocument {
        ParameterDocument::from_bytes(yaml.as_bytes()).unwrap()
    }

    #[test]
    fn test_merge_nested_output_wins() {
        let mut params = doc("general:\n  cluster:\n    name: demo\n  region: eu\nnodes: 3\n");
        params
            .merge_bytes(b"general:\n  region: us\n  zone: b\nnodes: [a, b]\n")
            .unwrap();

        assert_eq!(
            params,
            doc("general:\n  cluster:\n    name: demo\n  region: us\n  zone: b\nnodes: [a, b]\n")
        );
    }

    #[test]
    fn test_merge_empty_output_is_noop() {
        let mut params = doc("a: 1\n");
        params.merge_bytes(b"").unwrap();
        params.merge_bytes(b"  \n").unwrap();
        params.merge_bytes(b"~\n").unwrap();
        assert_eq!(params, doc("a: 1\n"));
    }

    #[test]
    fn test_merge_rejects_non_mapping_output() {
        let mut params = doc("a: 1\n");
        let err = params.merge_bytes(b"- just\n- a list\n").unwrap_err();
        assert!(matches!(err, ProvisionError::Parse(_)));
    }

    #[test]
    fn test_set_path_creates_mappings() {
        let mut params = doc("general: scalar\n");
        params.set_path(&["general", "cluster", "name"], Value::from("demo"));
        assert_eq!(params, doc("general:\n  cluster:\n    name: demo\n"));
    }

    #[test]
    fn test_validate_collects_every_problem() {
        let params = doc(
            "inventory:\n  - name: m1\n    privateIP: 10.0.0.1\n    roles: [master]\n  - name: m2\n    roles: []\n  - privateIP: ''\n",
        );
        let errors = params.validate();
        assert_eq!(errors.len(), 4);
        assert!(errors[0].to_string().contains("inventory[1] (m2): privateIP"));
        assert!(errors[1].to_string().contains("inventory[1] (m2): at least one role"));
    }

    #[test]
    fn test_valid_inventory() {
        let params =
            doc("inventory:\n  - name: m1\n    privateIP: 10.0.0.1\n    roles: [master, worker]\n");
        assert!(params.validate().is_empty());
        assert_eq!(params.inventory().as_sequence().unwrap().len(), 1);
        assert!(ParameterDocument::new().inventory().as_sequence().unwrap().is_empty());
    }
}
