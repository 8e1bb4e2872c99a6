// ============================================================================
// Intercepted Sessions
// ============================================================================
//
// Code that only knows about sessions (not scopes) tends to call
// `save_changes` and `dispose` on them directly. Going around the scope like
// that would commit or release a session shared by the whole scope chain.
// `InterceptedSession` routes those two calls to the ambient scope instead;
// everything else reaches the wrapped session through `Deref`.
//
// ============================================================================

use crate::ambient;
use crate::core::{Result, ScopeError};
use crate::scope::ScopeState;
use crate::session::{EntityKey, Session};
use std::ops::Deref;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct InterceptedSession<S: Session> {
    session: Arc<S>,
}

impl<S: Session> InterceptedSession<S> {
    pub fn new(session: Arc<S>) -> Self {
        Self { session }
    }

    pub fn inner(&self) -> &Arc<S> {
        &self.session
    }

    fn writable_scope() -> Result<Arc<ScopeState>> {
        let scope = ambient::current().ok_or(ScopeError::NoAmbientScope)?;
        if scope.is_read_only() {
            return Err(ScopeError::ReadOnlyAmbientScope);
        }
        Ok(scope)
    }

    /// Commits the ambient scope, then refreshes whatever this session had
    /// changed in the parent scope.
    pub fn save_changes(&self) -> Result<usize> {
        let scope = Self::writable_scope()?;
        let changed = self.session.changed_entities();
        let affected = scope.commit()?;
        scope.refresh_in_parent(&changed)?;
        Ok(affected)
    }

    pub async fn save_changes_async(&self, cancel: &CancellationToken) -> Result<usize> {
        let scope = Self::writable_scope()?;
        let changed: Vec<EntityKey> = self.session.changed_entities();
        let affected = scope.commit_async(cancel).await?;
        scope.refresh_in_parent_async(&changed, cancel).await?;
        Ok(affected)
    }

    /// Disposes the ambient scope rather than the shared session.
    pub fn dispose(&self) -> Result<()> {
        let scope = ambient::current().ok_or(ScopeError::NoAmbientScope)?;
        scope.dispose()
    }
}

impl<S: Session> Deref for InterceptedSession<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.session
    }
}

impl<S: Session> Clone for InterceptedSession<S> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
        }
    }
}
