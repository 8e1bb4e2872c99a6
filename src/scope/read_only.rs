use super::state::{ScopeState, ScopeStatus};
use super::{ScopeDiagnostic, ScopeOptions};
use crate::collection::SessionCollection;
use crate::core::{InstanceId, IsolationLevel, JoinMode, Result};
use crate::session::{Session, SessionFactory};
use std::sync::Arc;

/// A scope for reads only. Sessions are created with the read-only hint and
/// the scope completes itself when disposed; there is nothing to commit.
pub struct ReadOnlyScope {
    state: Arc<ScopeState>,
}

impl ReadOnlyScope {
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

    /// Opens a read-only scope; `options.read_only` is ignored.
    pub fn with_options(
        options: &ScopeOptions,
        factory: &SessionFactory,
        diagnostic: Option<ScopeDiagnostic>,
    ) -> Result<Self> {
        let options = options.read_only(true);
        let state = ScopeState::open(&options, factory, diagnostic)?;
        Ok(Self { state })
    }

    pub fn id(&self) -> InstanceId {
        self.state.id()
    }

    pub fn is_nested(&self) -> bool {
        self.state.is_nested()
    }

    pub fn status(&self) -> ScopeStatus {
        self.state.status()
    }

    pub fn is_disposed(&self) -> bool {
        self.state.is_disposed()
    }

    pub fn sessions(&self) -> &Arc<SessionCollection> {
        self.state.sessions()
    }

    pub fn get<S: Session>(&self) -> Result<Arc<S>> {
        self.state.get::<S>()
    }

    pub fn dispose(&self) -> Result<()> {
        self.state.dispose()
    }
}

impl Drop for ReadOnlyScope {
    fn drop(&mut self) {
        self.state.dispose_on_drop();
    }
}

impl std::fmt::Debug for ReadOnlyScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadOnlyScope")
            .field("id", &self.id())
            .field("nested", &self.is_nested())
            .field("status", &self.status())
            .finish()
    }
}
