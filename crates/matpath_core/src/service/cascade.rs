//! Bounded-concurrency bulk rewrite over a store stream.
//!
//! # Responsibility
//! - Drain a filtered node stream and apply a per-node update to each match.
//! - Keep at most `concurrency` store updates in flight at any time.
//!
//! # Invariants
//! - Completion is reported only after the stream is exhausted and every
//!   in-flight update has settled.
//! - The first failure stops the run; already applied updates stay applied.
//! - No ordering between nodes: each rewrite depends only on its own node.

use crate::error::TreeError;
use crate::model::node::Node;
use crate::model::selector::{Filter, NodeUpdate};
use crate::store::{NodeStore, StoreError};
use futures::TryStreamExt;
use log::{error, info};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use thiserror::Error;

/// A cascade that stopped before draining its stream.
///
/// `updated` counts rewrites that landed before the failure. Re-running the
/// same cascade is safe because each rewrite is idempotent.
#[derive(Debug, Error)]
#[error("cascade `{label}` failed after {updated} update(s): {source}")]
pub struct CascadeError {
    pub label: &'static str,
    pub updated: usize,
    #[source]
    pub source: StoreError,
}

/// Counters of a completed cascade.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CascadeReport {
    /// Nodes pulled from the stream.
    pub matched: usize,
    /// Updates the store reported as applied.
    pub updated: usize,
}

/// Worker pool with a fixed in-flight bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CascadeExecutor {
    concurrency: usize,
}

impl CascadeExecutor {
    /// # Errors
    /// - `InvalidConfig` when `concurrency` is 0.
    pub fn new(concurrency: usize) -> Result<Self, TreeError> {
        if concurrency == 0 {
            return Err(TreeError::InvalidConfig(
                "cascade concurrency must be at least 1".to_string(),
            ));
        }
        Ok(Self { concurrency })
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Streams `filter` matches and applies `rewrite` to each.
    ///
    /// `rewrite` returning `None` skips the node without a store write.
    pub async fn run<S, F>(
        &self,
        store: &S,
        label: &'static str,
        filter: Filter,
        rewrite: F,
    ) -> Result<CascadeReport, CascadeError>
    where
        S: NodeStore + ?Sized,
        F: Fn(&Node) -> Option<NodeUpdate> + Send + Sync,
    {
        let started_at = Instant::now();
        let matched = AtomicUsize::new(0);
        let updated = AtomicUsize::new(0);
        info!(
            "event=cascade_run module=cascade status=start label={label} concurrency={}",
            self.concurrency
        );

        let result = store
            .stream(filter)
            .try_for_each_concurrent(self.concurrency, |node| {
                let rewrite = &rewrite;
                let matched = &matched;
                let updated = &updated;
                async move {
                    matched.fetch_add(1, Ordering::Relaxed);
                    let Some(update) = rewrite(&node) else {
                        return Ok(());
                    };
                    if store.update_by_id(node.id(), &update).await? {
                        updated.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(())
                }
            })
            .await;

        let report = CascadeReport {
            matched: matched.load(Ordering::Relaxed),
            updated: updated.load(Ordering::Relaxed),
        };
        match result {
            Ok(()) => {
                info!(
                    "event=cascade_run module=cascade status=ok label={label} matched={} updated={} duration_ms={}",
                    report.matched,
                    report.updated,
                    started_at.elapsed().as_millis()
                );
                Ok(report)
            }
            Err(source) => {
                error!(
                    "event=cascade_run module=cascade status=error label={label} matched={} updated={} duration_ms={} error={source}",
                    report.matched,
                    report.updated,
                    started_at.elapsed().as_millis()
                );
                Err(CascadeError {
                    label,
                    updated: report.updated,
                    source,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::CascadeExecutor;

    #[test]
    fn zero_concurrency_is_rejected() {
        assert!(CascadeExecutor::new(0).is_err());
        assert_eq!(CascadeExecutor::new(3).expect("valid").concurrency(), 3);
    }
}
