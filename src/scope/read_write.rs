use super::state::{ScopeState, ScopeStatus};
use super::{ScopeDiagnostic, ScopeOptions};
use crate::collection::SessionCollection;
use crate::core::{InstanceId, IsolationLevel, JoinMode, Result};
use crate::proxy::InterceptedSession;
use crate::session::{EntityKey, Session, SessionFactory};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A read/write business transaction over one or more sessions.
///
/// Opening a scope makes it the ambient scope of the current flow. Exactly one
/// call to [`commit`](Scope::commit) is expected; a scope dropped without a
/// commit rolls back every change made through its sessions.
///
/// # Examples
///
/// ```
/// use dbscope::{JoinMode, Scope, SessionFactory};
/// use dbscope::memory::{MemorySession, MemoryStore};
///
/// # fn main() -> dbscope::Result<()> {
/// let store = MemoryStore::new();
/// let factory = SessionFactory::new()
///     .register(move |req| Ok(MemorySession::<()>::open(&store, req.read_only)));
///
/// let scope = Scope::new(JoinMode::JoinExisting, None, &factory, None)?;
/// let session = scope.get::<MemorySession>()?;
/// assert_eq!(session.tracked_count()?, 0);
/// assert_eq!(scope.commit()?, 0);
/// # Ok(())
/// # }
/// ```
pub struct Scope {
    state: Arc<ScopeState>,
}

impl Scope {
    pub fn new(
        join_mode: JoinMode,
        isolation_level: Option<IsolationLevel>,
        factory: &SessionFactory,
        diagnostic: Option<ScopeDiagnostic>,
    ) -> Result<Self> {
        let mut options = ScopeOptions::new().join_mode(join_mode);
        options.isolation_level = isolation_level;
        Self::with_options(&options, factory, diagnostic)
    }

    /// Opens a read/write scope; `options.read_only` is ignored.
    pub fn with_options(
        options: &ScopeOptions,
        factory: &SessionFactory,
        diagnostic: Option<ScopeDiagnostic>,
    ) -> Result<Self> {
        let options = options.read_only(false);
        let state = ScopeState::open(&options, factory, diagnostic)?;
        Ok(Self { state })
    }

    pub fn id(&self) -> InstanceId {
        self.state.id()
    }

    pub fn join_mode(&self) -> JoinMode {
        self.state.join_mode()
    }

    pub fn isolation_level(&self) -> Option<IsolationLevel> {
        self.state.isolation_level()
    }

    /// Whether this scope joined an ambient scope's sessions.
    pub fn is_nested(&self) -> bool {
        self.state.is_nested()
    }

    pub fn status(&self) -> ScopeStatus {
        self.state.status()
    }

    pub fn is_completed(&self) -> bool {
        self.state.status() != ScopeStatus::Active
    }

    pub fn is_disposed(&self) -> bool {
        self.state.is_disposed()
    }

    /// Ambient scope this scope found when it was opened, if still alive.
    pub fn parent_id(&self) -> Option<InstanceId> {
        self.state.parent_id()
    }

    /// The session collection, shared with every scope joined to it.
    pub fn sessions(&self) -> &Arc<SessionCollection> {
        self.state.sessions()
    }

    /// Gets or creates the session of type `S`.
    pub fn get<S: Session>(&self) -> Result<Arc<S>> {
        self.state.get::<S>()
    }

    /// Gets the session of type `S` wrapped so its own save and dispose calls
    /// go through the ambient scope.
    pub fn get_intercepted<S: Session>(&self) -> Result<InterceptedSession<S>> {
        self.state.get::<S>().map(InterceptedSession::new)
    }

    /// Saves every session of the chain and returns the affected row count.
    /// Nested scopes leave the commit to the outermost scope and return 0.
    pub fn commit(&self) -> Result<usize> {
        self.state.commit()
    }

    pub async fn commit_async(&self, cancel: &CancellationToken) -> Result<usize> {
        self.state.commit_async(cancel).await
    }

    /// Reloads the given entities in the parent scope's sessions after this
    /// scope committed them.
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

    /// Ends the scope and restores its parent as the ambient scope.
    ///
    /// Fails with a protocol violation when scopes are not disposed in reverse
    /// creation order.
    pub fn dispose(&self) -> Result<()> {
        self.state.dispose()
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        self.state.dispose_on_drop();
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.id())
            .field("nested", &self.is_nested())
            .field("status", &self.status())
            .finish()
    }
}
