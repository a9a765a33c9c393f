use serde_json::{Map, Value};

/// Conjunction of top-level field equalities. A `null` condition also
/// matches documents that lack the field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<(String, Value)>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self::all().and(field, value)
    }

    pub fn and(mut self, field: impl Into<String>, value: Value) -> Self {
        self.conditions.push((field.into(), value));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn matches(&self, doc: &Value) -> bool {
        self.conditions.iter().all(|(field, expected)| {
            match (doc.get(field.as_str()), expected) {
                (None, Value::Null) => true,
                (Some(actual), expected) => actual == expected,
                (None, _) => false,
            }
        })
    }
}

/// Include-list of top-level fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    fields: Vec<String>,
}

impl Projection {
    pub fn include<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn apply(&self, doc: &Value) -> Value {
        let mut out = Map::new();
        if let Some(obj) = doc.as_object() {
            for field in &self.fields {
                if let Some(v) = obj.get(field) {
                    out.insert(field.clone(), v.clone());
                }
            }
        }
        Value::Object(out)
    }
}
