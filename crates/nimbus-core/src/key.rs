use std::fmt;

use serde::Serialize;

use crate::error::Result;

/// Identity of an upstream request for deduplication purposes.
///
/// Two submissions are "the same request" if and only if their keys compare
/// equal: an operation name plus a canonical JSON rendering of the call's
/// parameters. Parameters are first converted to a `serde_json::Value`, whose
/// maps are backed by a `BTreeMap`, so structurally equal parameters produce
/// equal keys regardless of field declaration or insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    operation: String,
    canonical: String,
}

impl RequestKey {
    /// Build a key from an operation name and its parameters.
    ///
    /// Fails only if the parameters cannot be serialized to JSON.
    pub fn new<P: Serialize>(operation: &str, params: &P) -> Result<Self> {
        let value = serde_json::to_value(params)?;
        Ok(Self {
            operation: operation.to_string(),
            canonical: format!("{operation}({value})"),
        })
    }

    /// Key for a parameterless operation.
    pub fn bare(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            canonical: format!("{operation}()"),
        }
    }

    /// The operation name this key was built from.
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// The full canonical form, unique per distinct request.
    pub fn as_str(&self) -> &str {
        &self.canonical
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}
