//! Per-hierarchy configuration.
//!
//! # Responsibility
//! - Describe how one document collection forms a materialized-path tree.
//! - Validate settings that would silently break path invariants.
//!
//! # Invariants
//! - `path_separator` never appears in generated identifiers.
//! - `concurrency` is at least 1.

use crate::error::TreeError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_PATH_SEPARATOR: char = '#';
pub const DEFAULT_CONCURRENCY: usize = 5;

/// What happens to descendants when a node is deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeleteMode {
    /// Remove the node and its whole subtree.
    #[default]
    Delete,
    /// Remove the node only; children move up to the node's parent.
    Reparent,
}

/// Textual form of store-assigned identifiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdFormat {
    /// 32 lowercase hex digits.
    #[default]
    Simple,
    /// 8-4-4-4-12 hex groups.
    Hyphenated,
}

impl IdFormat {
    /// Produces a fresh identifier in this format.
    pub fn generate(self) -> String {
        let id = Uuid::new_v4();
        match self {
            Self::Simple => id.simple().to_string(),
            Self::Hyphenated => id.hyphenated().to_string(),
        }
    }
}

/// Settings of one hierarchy declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeConfig {
    /// Joins ancestor ids into a path. Any non-identifier character works;
    /// nesting compares paths segment by segment, not as plain text.
    pub path_separator: char,
    pub on_delete: DeleteMode,
    /// Upper bound of in-flight store updates during a cascade.
    pub concurrency: usize,
    pub id_format: IdFormat,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            path_separator: DEFAULT_PATH_SEPARATOR,
            on_delete: DeleteMode::Delete,
            concurrency: DEFAULT_CONCURRENCY,
            id_format: IdFormat::Simple,
        }
    }
}

impl TreeConfig {
    /// Parses a (possibly partial) JSON object; missing keys take defaults.
    ///
    /// # Errors
    /// - `InvalidConfig` when the JSON is malformed or fails [`Self::validate`].
    pub fn from_json_str(raw: &str) -> Result<Self, TreeError> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|err| TreeError::InvalidConfig(format!("malformed tree config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_separator(mut self, separator: char) -> Self {
        self.path_separator = separator;
        self
    }

    pub fn with_delete_mode(mut self, mode: DeleteMode) -> Self {
        self.on_delete = mode;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_id_format(mut self, format: IdFormat) -> Self {
        self.id_format = format;
        self
    }

    /// Checks settings against path invariants.
    ///
    /// # Errors
    /// - `InvalidConfig` for zero concurrency.
    /// - `InvalidConfig` for a separator that can occur inside a generated id.
    pub fn validate(&self) -> Result<(), TreeError> {
        if self.concurrency == 0 {
            return Err(TreeError::InvalidConfig(
                "concurrency must be at least 1".to_string(),
            ));
        }
        let sep = self.path_separator;
        if sep.is_alphanumeric()
            || sep.is_whitespace()
            || sep.is_control()
            || sep == '-'
            || sep == '_'
        {
            return Err(TreeError::InvalidConfig(format!(
                "path separator `{sep}` may collide with node identifiers"
            )));
        }
        Ok(())
    }
}
