//! The storage contract every grant backend implements.

use crate::models::{Grant, GrantUse};
use crate::services::error::GrantError;
use async_trait::async_trait;
use std::sync::Arc;

/// Persistence for grants.
///
/// Implementations are shared by any number of concurrent callers. Each
/// operation is atomic on its own; nothing here holds a lock across calls.
/// Dropping an operation's future before it completes leaves the store as
/// if the operation had never started.
#[async_trait]
pub trait Storer: Send + Sync {
    /// Insert a new Active grant along with its ancestor IDs.
    ///
    /// Fails with [`GrantError::AlreadyExists`] when the ID is taken and with
    /// [`GrantError::SourceAlreadyUsed`] when `(source_type, source_id)` is
    /// taken. The ID check wins when both collide. A grant that is already
    /// used or revoked is rejected with [`GrantError::Invalid`].
    async fn create_grant(&self, grant: Grant) -> Result<(), GrantError>;

    /// Mark the grant named by `grant_use.grant` as used, recording the IP and
    /// time of use, and return the updated grant.
    ///
    /// Of any number of concurrent exchanges of one grant exactly one
    /// succeeds; the rest fail with [`GrantError::AlreadyUsed`].
    async fn exchange_grant(&self, grant_use: GrantUse) -> Result<Grant, GrantError>;

    /// Mark an Active grant as revoked and return the updated grant.
    async fn revoke_grant(&self, id: &str) -> Result<Grant, GrantError>;

    async fn get_grant(&self, id: &str) -> Result<Grant, GrantError>;

    async fn get_grant_by_source(
        &self,
        source_type: &str,
        source_id: &str,
    ) -> Result<Grant, GrantError>;

    /// Verify the backing store is reachable.
    async fn health_check(&self) -> Result<(), GrantError>;
}

/// Provisions isolated storers and cleans them up afterwards. Used by test
/// harnesses only.
#[async_trait]
pub trait StorerFactory: Send + Sync {
    async fn new_storer(&self) -> Result<Arc<dyn Storer>, GrantError>;

    async fn teardown_storers(&self) -> Result<(), GrantError>;
}

/// Shared state checks for backends that read a grant before writing it.
pub(crate) fn ensure_active(grant: &Grant) -> Result<(), GrantError> {
    if grant.used {
        return Err(GrantError::AlreadyUsed);
    }
    if grant.revoked {
        return Err(GrantError::Revoked);
    }
    Ok(())
}

/// Only Active grants may be created; the terminal flags are written by
/// exchange and revocation alone.
pub(crate) fn ensure_creatable(grant: &Grant) -> Result<(), GrantError> {
    if grant.used || grant.revoked {
        return Err(GrantError::Invalid(format!(
            "grant {} must be active when created, found {}",
            grant.id,
            grant.state()
        )));
    }
    Ok(())
}
