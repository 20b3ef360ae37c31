use serde_json::{Map, Value};
use std::collections::HashMap;

/// Rename-map filter applied to nested upstream objects before they land in
/// the index document.
///
/// The filter keeps only the keys present in its mapping and writes them out
/// under the mapped names, e.g. `{displayName -> display_name}`. It applies
/// to a single object or to each object element of a sequence; element order
/// is preserved.
#[derive(Debug, Clone)]
pub struct ValueFilter {
    name: String,
    mappings: HashMap<String, String>,
}

impl ValueFilter {
    pub fn new(name: impl Into<String>, mappings: HashMap<String, String>) -> Self {
        Self {
            name: name.into(),
            mappings,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Apply the filter. Scalars and non-object sequence elements cannot be
    /// filtered; they pass through unchanged with a warning.
    pub fn apply(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(self.filter_object(map)),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| match item {
                        Value::Object(map) => Value::Object(self.filter_object(map)),
                        other => {
                            log::warn!(
                                "value filter `{}` applied to non-object sequence element, passing through unfiltered",
                                self.name
                            );
                            other.clone()
                        }
                    })
                    .collect(),
            ),
            other => {
                log::warn!(
                    "value filter `{}` applied to non-object data, passing through unfiltered",
                    self.name
                );
                other.clone()
            }
        }
    }

    fn filter_object(&self, map: &Map<String, Value>) -> Map<String, Value> {
        let mut out = Map::new();
        for (source, target) in &self.mappings {
            if let Some(value) = map.get(source) {
                out.insert(target.clone(), value.clone());
            }
        }
        out
    }
}
