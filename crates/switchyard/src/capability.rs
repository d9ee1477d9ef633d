//! Capability table: which roles may invoke which methods, with which arguments.
//!
//! ```json
//! {
//!   "fs.read": {
//!     "allowedRoles": ["worker", "controller"],
//!     "constraints": { "path": { "pathPrefix": ["/data", "/tmp/app"] } }
//!   },
//!   "ui.setTheme": {
//!     "allowedRoles": ["ui-host"],
//!     "constraints": { "theme": { "oneOf": ["light", "dark"] } }
//!   }
//! }
//! ```
//!
//! Loaded once at startup and shared read-only (`Arc<CapabilityTable>`).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bridge::protocol::validate_method_name;
use crate::process::Role;

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("failed to read capability table {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid capability table: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid capability table: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityTable {
    grants: HashMap<String, Grant>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grant {
    pub allowed_roles: BTreeSet<Role>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub constraints: BTreeMap<String, Constraint>,
}

/// Restriction on one named argument. A constrained argument that is missing
/// from the call does not satisfy its constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Constraint {
    /// String argument naming an absolute path under one of these prefixes.
    PathPrefix(Vec<String>),
    /// Argument equal to one of these values.
    OneOf(Vec<Value>),
    /// String argument of at most this many characters.
    MaxLength(usize),
}

impl Constraint {
    /// `Err` carries a short reason suitable for an audit line.
    pub fn check(&self, value: Option<&Value>) -> Result<(), String> {
        let Some(value) = value else {
            return Err("argument missing".to_string());
        };
        match self {
            Self::PathPrefix(prefixes) => {
                let Some(path) = value.as_str() else {
                    return Err("expected a path string".to_string());
                };
                let path = Path::new(path);
                if !path.is_absolute() {
                    return Err("path must be absolute".to_string());
                }
                if path.components().any(|c| c == Component::ParentDir) {
                    return Err("path must not contain '..'".to_string());
                }
                if prefixes.iter().any(|p| path.starts_with(Path::new(p))) {
                    Ok(())
                } else {
                    Err("path outside allowed prefixes".to_string())
                }
            }
            Self::OneOf(allowed) => {
                if allowed.contains(value) {
                    Ok(())
                } else {
                    Err("value not in allowed set".to_string())
                }
            }
            Self::MaxLength(max) => match value.as_str() {
                Some(s) if s.chars().count() <= *max => Ok(()),
                Some(_) => Err(format!("longer than {max} characters")),
                None => Err("expected a string".to_string()),
            },
        }
    }
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(json: &str) -> Result<Self, CapabilityError> {
        let table: Self = serde_json::from_str(json)?;
        table.validate()?;
        Ok(table)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CapabilityError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| CapabilityError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let table = Self::from_json_str(&json)?;
        tracing::info!(path = %path.display(), methods = table.len(), "Loaded capability table");
        Ok(table)
    }

    fn validate(&self) -> Result<(), CapabilityError> {
        for (method, grant) in &self.grants {
            validate_method_name(method).map_err(|e| CapabilityError::Invalid(e.to_string()))?;
            for (arg, constraint) in &grant.constraints {
                if let Constraint::PathPrefix(prefixes) = constraint {
                    if let Some(bad) = prefixes.iter().find(|p| !Path::new(p).is_absolute()) {
                        return Err(CapabilityError::Invalid(format!(
                            "{method}: pathPrefix {bad:?} for {arg} is not absolute"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Allow `roles` to call `method`. Replaces any existing grant.
    ///
    /// Invalid method names are logged and left ungranted.
    pub fn grant(mut self, method: &str, roles: impl IntoIterator<Item = Role>) -> Self {
        if let Err(e) = validate_method_name(method) {
            tracing::error!(error = %e, "Grant ignored");
            return self;
        }
        self.grants.insert(
            method.to_string(),
            Grant {
                allowed_roles: roles.into_iter().collect(),
                constraints: BTreeMap::new(),
            },
        );
        self
    }

    /// Constrain argument `arg` of an already granted `method`.
    pub fn with_constraint(mut self, method: &str, arg: &str, constraint: Constraint) -> Self {
        if let Some(grant) = self.grants.get_mut(method) {
            grant.constraints.insert(arg.to_string(), constraint);
        } else {
            tracing::warn!(method, arg, "Constraint for ungranted method ignored");
        }
        self
    }

    pub fn get(&self, method: &str) -> Option<&Grant> {
        self.grants.get(method)
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}
