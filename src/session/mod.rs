// ============================================================================
// Session Abstraction
// ============================================================================
//
// A session is the unit of work supplied by the persistence layer: it owns a
// first-level cache of loaded entities, tracks their changes, and knows how to
// save or discard them. Scopes only ever talk to sessions through this trait.
//
// ============================================================================

pub mod factory;

pub use factory::{SessionFactory, SessionRequest};

use crate::core::{IsolationLevel, Result, ScopeError};
use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use std::fmt;
use tokio_util::sync::CancellationToken;

/// A persisted record that a session can track.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable primary key of the record.
    fn id(&self) -> String;

    /// Logical entity type name used in keys.
    fn entity_name() -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Identity of one entity across sessions: its type plus its primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub entity: &'static str,
    pub id: String,
}

impl EntityKey {
    pub fn new(entity: &'static str, id: impl Into<String>) -> Self {
        Self {
            entity,
            id: id.into(),
        }
    }

    pub fn of<E: Entity>(entity: &E) -> Self {
        Self::new(E::entity_name(), entity.id())
    }

    pub fn for_id<E: Entity>(id: impl Into<String>) -> Self {
        Self::new(E::entity_name(), id)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity, self.id)
    }
}

/// Change-tracking state of a cached entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Detached,
    Unchanged,
    Added,
    Modified,
    Deleted,
}

impl EntryState {
    /// Whether saving the session would write this entry.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            EntryState::Added | EntryState::Modified | EntryState::Deleted
        )
    }
}

/// Unit of work supplied by the persistence layer.
///
/// Implementations use interior mutability: a session is shared between every
/// scope of a nested chain through an `Arc`, but only one logical flow uses it
/// at a time.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Writes every pending change and returns the number of affected rows.
    fn save_changes(&self) -> Result<usize>;

    async fn save_changes_async(&self, cancel: &CancellationToken) -> Result<usize> {
        if cancel.is_cancelled() {
            return Err(ScopeError::Cancelled);
        }
        self.save_changes()
    }

    /// Discards pending changes held in the first-level cache.
    fn rollback(&self) -> Result<()>;

    /// Releases the underlying connection. Called once, by the owning collection.
    fn dispose(&self);

    fn begin_transaction(&self, isolation: IsolationLevel) -> Result<()>;

    fn commit_transaction(&self) -> Result<()>;

    fn rollback_transaction(&self) -> Result<()>;

    /// Tracking state of `key` in this session's cache.
    fn entry_state(&self, key: &EntityKey) -> EntryState;

    /// Entities currently added, modified or deleted.
    fn changed_entities(&self) -> Vec<EntityKey>;

    /// Reloads the cached copy of `key` from the store in place, keeping the
    /// identity of the object other code may hold.
    fn reload(&self, key: &EntityKey) -> Result<()>;

    async fn reload_async(&self, key: &EntityKey, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(ScopeError::Cancelled);
        }
        self.reload(key)
    }
}
