// src/workflow/definition.rs

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reference to a definition by id and version, written `id@version`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DefinitionRef {
    pub id: String,
    pub version: String,
}

impl DefinitionRef {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for DefinitionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}

impl FromStr for DefinitionRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, version) = s
            .trim()
            .rsplit_once('@')
            .ok_or_else(|| format!("invalid definition reference '{s}' (expected id@version)"))?;
        if id.is_empty() || version.is_empty() {
            return Err(format!(
                "invalid definition reference '{s}' (id and version must be non-empty)"
            ));
        }
        Ok(DefinitionRef::new(id, version))
    }
}

/// Immutable, versioned workflow definition.
///
/// The `document` is opaque to the orchestration core; it is handed to the
/// execution process, which owns its semantics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub version: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub document: Value,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, version: impl Into<String>, document: Value) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            name: None,
            document,
        }
    }

    pub fn reference(&self) -> DefinitionRef {
        DefinitionRef::new(self.id.clone(), self.version.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_reference_on_last_at_sign() {
        let r: DefinitionRef = "team@acme/echo@v1".parse().unwrap();
        assert_eq!(r.id, "team@acme/echo");
        assert_eq!(r.version, "v1");
        assert_eq!(r.to_string(), "team@acme/echo@v1");
    }

    #[test]
    fn rejects_reference_without_version() {
        assert!("echo".parse::<DefinitionRef>().is_err());
        assert!("echo@".parse::<DefinitionRef>().is_err());
    }
}
