//! In-memory grant storer.
//!
//! The table keeps two unique indexes: grant ID and `(source_type,
//! source_id)`. Every write takes the table's write lock, runs all of its
//! index checks, and only then mutates the table in place, so a rejected
//! write changes nothing. No lock is held across an `.await`, and each
//! critical section is a constant number of map operations. Readers see
//! only committed states.

use crate::models::{Grant, GrantUse};
use crate::services::error::GrantError;
use crate::services::metrics::observe_operation;
use crate::services::storer::{ensure_active, ensure_creatable, Storer, StorerFactory};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::instrument;

const BACKEND: &str = "memory";

/// Compared case-sensitively, matching the relational and document backends;
/// keys are never lowercased.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SourceKey {
    source_type: String,
    source_id: String,
}

impl SourceKey {
    fn new(source_type: &str, source_id: &str) -> Self {
        Self {
            source_type: source_type.to_string(),
            source_id: source_id.to_string(),
        }
    }

    fn of(grant: &Grant) -> Self {
        Self::new(&grant.source_type, &grant.source_id)
    }
}

#[derive(Debug, Default)]
struct GrantTable {
    by_id: HashMap<String, Grant>,
    by_source: HashMap<SourceKey, String>,
}

impl GrantTable {
    fn get(&self, id: &str) -> Option<&Grant> {
        self.by_id.get(id)
    }

    fn get_by_source(&self, key: &SourceKey) -> Option<&Grant> {
        self.by_source.get(key).and_then(|id| self.by_id.get(id))
    }

    fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Insert after both uniqueness checks pass. The ID is checked first.
    fn insert(&mut self, grant: Grant) -> Result<(), GrantError> {
        if self.by_id.contains_key(&grant.id) {
            return Err(GrantError::AlreadyExists);
        }
        let key = SourceKey::of(&grant);
        if self.by_source.contains_key(&key) {
            return Err(GrantError::SourceAlreadyUsed);
        }

        self.by_source.insert(key, grant.id.clone());
        self.by_id.insert(grant.id.clone(), grant);
        Ok(())
    }

    /// Replace an Active grant with `update(grant)`. Source fields are never
    /// changed by a transition, so the source index stays valid.
    fn transition<F>(&mut self, id: &str, update: F) -> Result<Grant, GrantError>
    where
        F: FnOnce(Grant) -> Grant,
    {
        let found = self.by_id.get_mut(id).ok_or(GrantError::NotFound)?;
        ensure_active(found)?;

        *found = update(found.clone());
        Ok(found.clone())
    }
}

/// Single-process storer. The reference behaviour for every other backend.
#[derive(Default)]
pub struct MemoryStorer {
    table: RwLock<GrantTable>,
}

impl MemoryStorer {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, GrantTable> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, GrantTable> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Storer for MemoryStorer {
    #[instrument(
        skip(self, grant),
        fields(grant = %grant.id, source_type = %grant.source_type, source_id = %grant.source_id)
    )]
    async fn create_grant(&self, grant: Grant) -> Result<(), GrantError> {
        observe_operation(BACKEND, "create_grant", async {
            ensure_creatable(&grant)?;
            self.write().insert(grant)
        })
        .await
    }

    #[instrument(skip(self, grant_use), fields(grant = %grant_use.grant))]
    async fn exchange_grant(&self, grant_use: GrantUse) -> Result<Grant, GrantError> {
        observe_operation(BACKEND, "exchange_grant", async {
            self.write()
                .transition(&grant_use.grant, |grant| grant_use.apply(grant))
        })
        .await
    }

    #[instrument(skip(self))]
    async fn revoke_grant(&self, id: &str) -> Result<Grant, GrantError> {
        observe_operation(BACKEND, "revoke_grant", async {
            self.write().transition(id, |mut grant| {
                grant.revoked = true;
                grant
            })
        })
        .await
    }

    #[instrument(skip(self))]
    async fn get_grant(&self, id: &str) -> Result<Grant, GrantError> {
        observe_operation(BACKEND, "get_grant", async {
            self.read().get(id).cloned().ok_or(GrantError::NotFound)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn get_grant_by_source(
        &self,
        source_type: &str,
        source_id: &str,
    ) -> Result<Grant, GrantError> {
        observe_operation(BACKEND, "get_grant_by_source", async {
            self.read()
                .get_by_source(&SourceKey::new(source_type, source_id))
                .cloned()
                .ok_or(GrantError::NotFound)
        })
        .await
    }

    async fn health_check(&self) -> Result<(), GrantError> {
        Ok(())
    }
}

/// Factory for in-memory storers; they need no teardown.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryFactory;

#[async_trait]
impl StorerFactory for MemoryFactory {
    async fn new_storer(&self) -> Result<Arc<dyn Storer>, GrantError> {
        Ok(Arc::new(MemoryStorer::new()))
    }

    async fn teardown_storers(&self) -> Result<(), GrantError> {
        Ok(())
    }
}
