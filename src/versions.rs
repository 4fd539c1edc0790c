//! Document version lineage.
//!
//! Revisions link to the revision they replaced through `parent_id`. The
//! resolver walks up to the root of a lineage and then collects every
//! revision below it, so the history of any member is the whole tree.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::warn;

use crate::error::{Error, Result};
use crate::models::Document;
use crate::store::DocumentStore;

pub struct VersionTreeResolver {
    store: Arc<dyn DocumentStore>,
}

impl VersionTreeResolver {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Follow `parent_id` until a document without a parent.
    ///
    /// A parent that cannot be loaded ends the walk: the last document
    /// reached is the root. Revisiting a document is a cycle and fails with
    /// [`Error::DataIntegrity`].
    pub async fn root_of(&self, id: &str) -> Result<Document> {
        let mut current = self
            .store
            .get_document(id)
            .await?
            .ok_or_else(|| Error::not_found("document", id))?;
        let mut visited = HashSet::from([current.id.clone()]);

        while let Some(parent_id) = current.parent_id.clone() {
            if !visited.insert(parent_id.clone()) {
                return Err(Error::DataIntegrity(format!(
                    "version cycle through document {}",
                    parent_id
                )));
            }
            match self.store.get_document(&parent_id).await {
                Ok(Some(parent)) => current = parent,
                Ok(None) => break,
                Err(e) => {
                    warn!(document_id = %parent_id, error = %e, "parent lookup failed; treating as root");
                    break;
                }
            }
        }
        Ok(current)
    }

    /// Every revision in the lineage of `id`, newest first.
    pub async fn history(&self, id: &str) -> Result<Vec<Document>> {
        let root = self.root_of(id).await?;

        let mut seen = HashSet::from([root.id.clone()]);
        let mut stack = vec![root.id.clone()];
        let mut collected = vec![root];

        while let Some(current) = stack.pop() {
            let children = match self.store.children_of(&current).await {
                Ok(children) => children,
                Err(e) => {
                    warn!(document_id = %current, error = %e, "child lookup failed; skipping subtree");
                    continue;
                }
            };
            for child in children {
                if !seen.insert(child.id.clone()) {
                    return Err(Error::DataIntegrity(format!(
                        "document {} reached twice in version tree",
                        child.id
                    )));
                }
                stack.push(child.id.clone());
                collected.push(child);
            }
        }

        collected.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(collected)
    }
}
