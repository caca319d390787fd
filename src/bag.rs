//! Loosely typed configuration maps.
//!
//! Driver configurations and update-handler configurations arrive as arbitrary
//! JSON objects. [`ConfigBag`] keeps them ordered and verbatim, and offers
//! typed getters: a missing key yields the caller's default, a present key of
//! the wrong type is an error.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BagError {
    #[error("error casting {key} to {expected}")]
    TypeMismatch { key: String, expected: &'static str },

    #[error("error casting element {index} of {key} to string")]
    ElementMismatch { key: String, index: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigBag(BTreeMap<String, Value>);

impl ConfigBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, handy when assembling configs in code.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get_str(&self, key: &str, default: &str) -> Result<String, BagError> {
        match self.0.get(key) {
            None => Ok(default.to_string()),
            Some(Value::String(s)) => Ok(s.clone()),
            Some(_) => Err(BagError::TypeMismatch {
                key: key.to_string(),
                expected: "string",
            }),
        }
    }

    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool, BagError> {
        match self.0.get(key) {
            None => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(_) => Err(BagError::TypeMismatch {
                key: key.to_string(),
                expected: "bool",
            }),
        }
    }

    /// An empty array counts as absent and yields the default.
    pub fn get_string_list(&self, key: &str, default: &[&str]) -> Result<Vec<String>, BagError> {
        let fallback = || default.iter().map(|s| s.to_string()).collect();
        let items = match self.0.get(key) {
            None => return Ok(fallback()),
            Some(Value::Array(items)) => items,
            Some(_) => {
                return Err(BagError::TypeMismatch {
                    key: key.to_string(),
                    expected: "[]string",
                })
            }
        };
        if items.is_empty() {
            return Ok(fallback());
        }

        items
            .iter()
            .enumerate()
            .map(|(index, item)| match item {
                Value::String(s) => Ok(s.clone()),
                _ => Err(BagError::ElementMismatch {
                    key: key.to_string(),
                    index,
                }),
            })
            .collect()
    }
}

impl From<BTreeMap<String, Value>> for ConfigBag {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}
