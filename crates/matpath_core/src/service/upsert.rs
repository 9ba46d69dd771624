//! Atomic find-or-create.
//!
//! # Responsibility
//! - Validate a selector/body pair and hand it to the store's atomic upsert.
//! - Report whether the returned node was created by this call.
//!
//! # Invariants
//! - Requests are immutable values; `execute` can be re-run freely.
//! - An empty selector is rejected instead of matching an arbitrary node.

use crate::error::{TreeError, TreeResult};
use crate::model::node::Node;
use crate::model::selector::{Body, Selector, UpsertMode};
use crate::store::NodeStore;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Upsert behavior switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpsertOptions {
    /// Also write the body into an already existing match.
    pub upsert: bool,
}

impl UpsertOptions {
    pub fn overwrite() -> Self {
        Self { upsert: true }
    }

    pub fn mode(self) -> UpsertMode {
        if self.upsert {
            UpsertMode::Set
        } else {
            UpsertMode::SetOnInsert
        }
    }
}

/// Node returned by a find-or-create together with its origin.
#[derive(Debug, Clone, PartialEq)]
pub struct FindOrCreateOutcome {
    pub doc: Node,
    /// `true` when this call inserted `doc`.
    pub is_new: bool,
}

/// One find-or-create request.
#[derive(Debug, Clone, PartialEq)]
pub struct FindOrCreate {
    pub selector: Selector,
    pub body: Body,
    pub options: UpsertOptions,
}

impl FindOrCreate {
    pub fn new(selector: Selector) -> Self {
        Self {
            selector,
            body: Body::default(),
            options: UpsertOptions::default(),
        }
    }

    pub fn body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    pub fn options(mut self, options: UpsertOptions) -> Self {
        self.options = options;
        self
    }

    /// Builds a request from caller JSON; a `null` or absent body is empty.
    pub fn from_json(selector: Value, body: Option<Value>) -> TreeResult<Self> {
        let selector = Selector::from_json(selector)?;
        let body = match body {
            Some(value) => Body::from_json(value)?,
            None => Body::default(),
        };
        Ok(Self::new(selector).body(body))
    }

    pub fn validate(&self) -> TreeResult<()> {
        if self.selector.is_empty() {
            return Err(TreeError::InvalidSelector(
                "selector must name at least one criterion".to_string(),
            ));
        }
        self.selector.validate()
    }

    /// Runs the request as one atomic store step.
    ///
    /// # Errors
    /// - `InvalidSelector` before any store access.
    /// - `Store` when the upsert fails; nothing was created then.
    pub async fn execute<S>(&self, store: &S) -> TreeResult<FindOrCreateOutcome>
    where
        S: NodeStore + ?Sized,
    {
        self.validate()?;
        let outcome = store
            .find_one_and_upsert(&self.selector, &self.body, self.options.mode())
            .await?;
        debug!(
            "event=find_or_create module=upsert status=ok id={} created={}",
            outcome.node.id(),
            !outcome.updated_existing
        );
        Ok(FindOrCreateOutcome {
            doc: outcome.node,
            is_new: !outcome.updated_existing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{FindOrCreate, UpsertOptions};
    use crate::error::TreeError;
    use crate::model::selector::{Selector, UpsertMode};
    use serde_json::json;

    #[test]
    fn options_map_to_store_modes() {
        assert_eq!(UpsertOptions::default().mode(), UpsertMode::SetOnInsert);
        assert_eq!(UpsertOptions::overwrite().mode(), UpsertMode::Set);
        let parsed: UpsertOptions = serde_json::from_value(json!({})).expect("defaults");
        assert!(!parsed.upsert);
    }

    #[test]
    fn empty_selector_is_rejected() {
        let err = FindOrCreate::new(Selector::new())
            .validate()
            .expect_err("empty selector");
        assert!(matches!(err, TreeError::InvalidSelector(_)));
    }

    #[test]
    fn from_json_accepts_missing_body() {
        let request = FindOrCreate::from_json(json!({"name": "x"}), None).expect("request");
        assert!(request.body.is_empty());
        assert!(request.validate().is_ok());
    }
}
