//! Access to the ambient scope from code that did not open it.
//!
//! Repositories and services deep in a call chain use these locators instead
//! of taking a scope parameter. Both fail cleanly when no scope is ambient.

use crate::ambient;
use crate::core::{Result, ScopeError};
use crate::proxy::InterceptedSession;
use crate::scope::{AmbientScope, ScopeState};
use crate::session::Session;
use std::sync::Arc;

/// A session together with what the ambient scope says about it.
#[derive(Debug, Clone)]
pub struct SessionMetadata<S> {
    pub session: Arc<S>,
    pub read_only: bool,
}

/// Resolves sessions through the ambient scope.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmbientSessionLocator;

impl AmbientSessionLocator {
    pub fn new() -> Self {
        Self
    }

    /// The ambient scope's session of type `S`, created on first use.
    pub fn get<S: Session>(&self) -> Result<Arc<S>> {
        Self::ambient()?.get::<S>()
    }

    /// Like [`get`](Self::get) but yields `None` when no scope is ambient.
    pub fn try_get<S: Session>(&self) -> Result<Option<Arc<S>>> {
        match ambient::current() {
            Some(scope) => scope.get::<S>().map(Some),
            None => Ok(None),
        }
    }

    pub fn get_with_metadata<S: Session>(&self) -> Result<SessionMetadata<S>> {
        let scope = Self::ambient()?;
        Ok(SessionMetadata {
            session: scope.get::<S>()?,
            read_only: scope.is_read_only(),
        })
    }

    pub fn get_intercepted<S: Session>(&self) -> Result<InterceptedSession<S>> {
        self.get::<S>().map(InterceptedSession::new)
    }

    fn ambient() -> Result<Arc<ScopeState>> {
        ambient::current().ok_or(ScopeError::NoAmbientScope)
    }
}

/// Resolves the ambient scope itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmbientScopeLocator;

impl AmbientScopeLocator {
    pub fn new() -> Self {
        Self
    }

    pub fn get(&self) -> Result<AmbientScope> {
        self.try_get().ok_or(ScopeError::NoAmbientScope)
    }

    pub fn try_get(&self) -> Option<AmbientScope> {
        ambient::current().map(AmbientScope::new)
    }
}
