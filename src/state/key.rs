// src/state/key.rs

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::StateError;

/// Namespaced key of a scalar state field: `<namespace>/<field>`.
///
/// The namespace is normally the capability tag of the worker that owns
/// the field, e.g. `security/approved`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StateKey {
    namespace: String,
    field: String,
}

impl StateKey {
    pub fn new(namespace: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            field: field.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn field(&self) -> &str {
        &self.field
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.field)
    }
}

impl FromStr for StateKey {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, field)) if !ns.is_empty() && !field.is_empty() => {
                Ok(StateKey::new(ns, field))
            }
            _ => Err(StateError::InvalidKey(s.to_string())),
        }
    }
}

impl TryFrom<String> for StateKey {
    type Error = StateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StateKey> for String {
    fn from(key: StateKey) -> Self {
        key.to_string()
    }
}
