use std::fmt;

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

pub type Mapping = IndexMap<String, Value>;

/// An untyped pipeline document node.
///
/// `Reference` holds the pointer of a `!reference [...]` tag and only exists
/// between loading and reference resolution.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(serde_yaml::Number),
    String(String),
    Sequence(Vec<Value>),
    Mapping(Mapping),
    Reference(Vec<Value>),
}

impl Default for Value {
    fn default() -> Self {
        Self::Mapping(Mapping::new())
    }
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&Vec<Value>> {
        match self {
            Self::Sequence(seq) => Some(seq),
            _ => None,
        }
    }

    pub fn as_mapping(&self) -> Option<&Mapping> {
        match self {
            Self::Mapping(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_mapping_mut(&mut self) -> Option<&mut Mapping> {
        match self {
            Self::Mapping(map) => Some(map),
            _ => None,
        }
    }

    /// Mapping lookup that treats an explicit `null` like an absent key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_mapping()
            .and_then(|map| map.get(key))
            .filter(|value| !value.is_null())
    }

    /// String form of a scalar, as used for variables and script lines.
    pub fn scalar_string(&self) -> Option<String> {
        match self {
            Self::String(s) => Some(s.clone()),
            Self::Number(n) => Some(n.to_string()),
            Self::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Sequence(_) => "sequence",
            Self::Mapping(_) => "mapping",
            Self::Reference(_) => "reference",
        }
    }

    pub fn contains_reference(&self) -> bool {
        match self {
            Self::Reference(_) => true,
            Self::Sequence(seq) => seq.iter().any(Value::contains_reference),
            Self::Mapping(map) => map.values().any(Value::contains_reference),
            _ => false,
        }
    }

    /// Reads this node as a typed structure.
    pub fn to_typed<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(serde_json::to_value(self)?)?)
    }

    /// Deep-merges `other` into `self`.
    ///
    /// Mappings merge key by key; every other value, sequences included,
    /// replaces what was there.
    pub fn merge(&mut self, other: &Value) {
        match (self, other) {
            (Self::Mapping(target), Self::Mapping(source)) => {
                for (key, value) in source {
                    let nested = value.as_mapping().is_some()
                        && target.get(key).and_then(Value::as_mapping).is_some();
                    if let Some(existing) = target.get_mut(key).filter(|_| nested) {
                        existing.merge(value);
                    } else {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
            (target, source) => *target = source.clone(),
        }
    }
}

/// Merges documents in order into a fresh mapping; later documents win.
///
/// Documents that are not mappings contribute nothing.
pub fn merge_documents<'a>(documents: impl IntoIterator<Item = &'a Value>) -> Value {
    let mut merged = Value::default();
    for document in documents {
        if document.as_mapping().is_some() {
            merged.merge(document);
        }
    }
    merged
}

fn key_to_string(key: serde_yaml::Value) -> String {
    match key {
        serde_yaml::Value::String(s) => s,
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Null => "null".to_string(),
        other => serde_yaml::to_string(&other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

impl From<serde_yaml::Value> for Value {
    fn from(value: serde_yaml::Value) -> Self {
        match value {
            serde_yaml::Value::Null => Self::Null,
            serde_yaml::Value::Bool(b) => Self::Bool(b),
            serde_yaml::Value::Number(n) => Self::Number(n),
            serde_yaml::Value::String(s) => Self::String(s),
            serde_yaml::Value::Sequence(seq) => {
                Self::Sequence(seq.into_iter().map(Value::from).collect())
            }
            serde_yaml::Value::Mapping(map) => Self::Mapping(
                map.into_iter()
                    .map(|(k, v)| (key_to_string(k), Value::from(v)))
                    .collect(),
            ),
            serde_yaml::Value::Tagged(tagged) => {
                let is_reference = tagged.tag == "!reference";
                match Value::from(tagged.value) {
                    Self::Sequence(pointer) if is_reference => Self::Reference(pointer),
                    inner => inner,
                }
            }
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "<{}>", self.type_name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(text: &str) -> Value {
        Value::from(serde_yaml::from_str::<serde_yaml::Value>(text).unwrap())
    }

    #[test]
    fn test_reference_tag_becomes_pointer() {
        let doc = yaml("job:\n  script: !reference [.setup, script]\n");
        let script = doc.get("job").unwrap().get("script").unwrap();
        assert_eq!(
            script,
            &Value::Reference(vec![Value::from(".setup"), Value::from("script")])
        );
        assert!(doc.contains_reference());
    }

    #[test]
    fn test_merge_later_wins_and_nests() {
        let base = yaml("a: 1\nnested:\n  x: 1\n  y: 2\nlist: [1, 2]\n");
        let top = yaml("b: 2\nnested:\n  y: 3\nlist: [3]\n");

        let merged = merge_documents([&base, &top]);

        assert_eq!(merged, yaml("a: 1\nnested:\n  x: 1\n  y: 3\nlist: [3]\nb: 2\n"));
    }

    #[test]
    fn test_merge_null_overrides() {
        let merged = merge_documents([&yaml("image: alpine\n"), &yaml("image: ~\n")]);
        assert!(merged.as_mapping().unwrap()["image"].is_null());
        assert!(merged.get("image").is_none());
    }

    #[test]
    fn test_merge_skips_non_mapping_documents() {
        let merged = merge_documents([&yaml("a: 1\n"), &Value::Null]);
        assert_eq!(merged, yaml("a: 1\n"));
    }

    #[test]
    fn test_numeric_keys_and_display() {
        let doc = yaml("1: one\n");
        assert_eq!(doc.get("1"), Some(&Value::from("one")));
        assert_eq!(doc.to_string(), r#"{"1":"one"}"#);
    }
}
