use super::{ReadOnlyScope, Scope, ScopeDiagnostic, ScopeOptions};
use crate::ambient::AmbientSuppressor;
use crate::core::{IsolationLevel, JoinMode, Result, ScopeError};
use crate::session::SessionFactory;

/// Entry point for opening scopes.
///
/// Holds the session constructors every scope it opens will use, so callers
/// never build sessions themselves.
#[derive(Debug, Clone, Default)]
pub struct ScopeFactory {
    sessions: SessionFactory,
    diagnostic: Option<ScopeDiagnostic>,
}

impl ScopeFactory {
    pub fn new(sessions: SessionFactory) -> Self {
        Self {
            sessions,
            diagnostic: None,
        }
    }

    /// Records the lifecycle calls of every scope opened by this factory.
    pub fn with_diagnostic(mut self, diagnostic: ScopeDiagnostic) -> Self {
        self.diagnostic = Some(diagnostic);
        self
    }

    pub fn session_factory(&self) -> &SessionFactory {
        &self.sessions
    }

    pub fn diagnostic(&self) -> Option<&ScopeDiagnostic> {
        self.diagnostic.as_ref()
    }

    pub fn create(&self, join_mode: JoinMode) -> Result<Scope> {
        Scope::new(join_mode, None, &self.sessions, self.diagnostic.clone())
    }

    pub fn create_read_only(&self, join_mode: JoinMode) -> Result<ReadOnlyScope> {
        ReadOnlyScope::new(join_mode, None, &self.sessions, self.diagnostic.clone())
    }

    /// Opens a new, non-nested scope whose sessions all run in an explicit
    /// transaction at `level`.
    pub fn create_with_transaction(&self, level: IsolationLevel) -> Result<Scope> {
        Scope::new(
            JoinMode::ForceCreateNew,
            Some(level),
            &self.sessions,
            self.diagnostic.clone(),
        )
    }

    pub fn create_read_only_with_transaction(&self, level: IsolationLevel) -> Result<ReadOnlyScope> {
        ReadOnlyScope::new(
            JoinMode::ForceCreateNew,
            Some(level),
            &self.sessions,
            self.diagnostic.clone(),
        )
    }

    /// Opens a read/write scope described by `options`.
    pub fn open(&self, options: &ScopeOptions) -> Result<Scope> {
        if options.read_only {
            return Err(ScopeError::InvalidConfiguration(
                "read-only options must be opened with open_read_only".into(),
            ));
        }
        Scope::with_options(options, &self.sessions, self.diagnostic.clone())
    }

    pub fn open_read_only(&self, options: &ScopeOptions) -> Result<ReadOnlyScope> {
        ReadOnlyScope::with_options(options, &self.sessions, self.diagnostic.clone())
    }

    /// Hides the ambient scope until the returned guard is dropped.
    pub fn suppress_ambient_context(&self) -> AmbientSuppressor {
        AmbientSuppressor::new()
    }
}
