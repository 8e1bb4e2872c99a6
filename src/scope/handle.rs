use super::state::{ScopeState, ScopeStatus};
use crate::core::{InstanceId, Result};
use crate::session::{EntityKey, Session};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Non-owning handle on whichever scope is ambient, as returned by
/// [`AmbientScopeLocator`](crate::AmbientScopeLocator).
///
/// Dropping it does nothing; the scope's owner still controls its lifetime.
#[derive(Clone)]
pub struct AmbientScope {
    state: Arc<ScopeState>,
}

impl AmbientScope {
    pub(crate) fn new(state: Arc<ScopeState>) -> Self {
        Self { state }
    }

    pub fn id(&self) -> InstanceId {
        self.state.id()
    }

    pub fn is_read_only(&self) -> bool {
        self.state.is_read_only()
    }

    pub fn is_nested(&self) -> bool {
        self.state.is_nested()
    }

    pub fn status(&self) -> ScopeStatus {
        self.state.status()
    }

    pub fn get<S: Session>(&self) -> Result<Arc<S>> {
        self.state.get::<S>()
    }

    /// Fails with `ReadOnlyAmbientScope` on read-only scopes.
    pub fn commit(&self) -> Result<usize> {
        self.state.commit()
    }

    pub async fn commit_async(&self, cancel: &CancellationToken) -> Result<usize> {
        self.state.commit_async(cancel).await
    }

    pub fn refresh_in_parent(&self, entities: &[EntityKey]) -> Result<()> {
        self.state.refresh_in_parent(entities)
    }

    pub async fn refresh_in_parent_async(
        &self,
        entities: &[EntityKey],
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.state.refresh_in_parent_async(entities, cancel).await
    }

    /// Disposes the underlying scope on behalf of its owner.
    pub fn dispose(&self) -> Result<()> {
        self.state.dispose()
    }
}

impl std::fmt::Debug for AmbientScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmbientScope")
            .field("id", &self.id())
            .field("read_only", &self.is_read_only())
            .field("status", &self.status())
            .finish()
    }
}
