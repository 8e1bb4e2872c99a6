use super::Session;
use crate::core::{InstanceId, Result, ScopeError};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// What a session constructor is told about the scope asking for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionRequest {
    /// The outermost scope, which owns the collection the session joins.
    pub scope_id: InstanceId,
    /// Read-only scopes never save; constructors should disable change tracking.
    pub read_only: bool,
}

type Constructor = Arc<dyn Fn(&SessionRequest) -> Result<Box<dyn Any + Send + Sync>> + Send + Sync>;

/// Registry of session constructors, keyed by session type.
#[derive(Clone, Default)]
pub struct SessionFactory {
    constructors: HashMap<TypeId, Constructor>,
}

impl SessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a constructor for session type `S`.
    pub fn register<S, F>(mut self, constructor: F) -> Self
    where
        S: Session,
        F: Fn(&SessionRequest) -> Result<S> + Send + Sync + 'static,
    {
        let erased: Constructor = Arc::new(move |request: &SessionRequest| {
            let session = constructor(request)?;
            Ok(Box::new(session) as Box<dyn Any + Send + Sync>)
        });
        self.constructors.insert(TypeId::of::<S>(), erased);
        self
    }

    /// Registers `S::default()` as the constructor for `S`.
    pub fn register_default<S>(self) -> Self
    where
        S: Session + Default,
    {
        self.register(|_request: &SessionRequest| Ok(S::default()))
    }

    pub fn is_registered<S: Session>(&self) -> bool {
        self.constructors.contains_key(&TypeId::of::<S>())
    }

    /// Builds a new, independently configured `S`.
    pub fn create<S: Session>(&self, request: &SessionRequest) -> Result<S> {
        let constructor = self
            .constructors
            .get(&TypeId::of::<S>())
            .ok_or_else(|| ScopeError::UnregisteredSession(std::any::type_name::<S>().into()))?;

        let session = constructor(request)?;
        session.downcast::<S>().map(|boxed| *boxed).map_err(|_| {
            ScopeError::Usage(format!(
                "constructor registered for '{}' produced another type",
                std::any::type_name::<S>()
            ))
        })
    }
}

impl std::fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFactory")
            .field("registered", &self.constructors.len())
            .finish()
    }
}
