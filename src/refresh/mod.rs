// ============================================================================
// Entity Refresh
// ============================================================================
//
// Two sessions of the same type never share a first-level cache. After an
// inner scope commits, an outer scope that loaded the same entities would keep
// reading its stale copies; refreshing reloads those copies in place so every
// holder of the outer object sees the committed values.
//
// Only entities the caller names are refreshed, and only when the inner
// session tracks them and the outer copy has no pending edits of its own.
//
// ============================================================================

use crate::core::Result;
use crate::session::{EntityKey, EntryState, Session};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{Level, event};

/// Strategy for bringing an outer session's cached entity up to date.
#[async_trait]
pub trait EntityRefresh: Send + Sync {
    /// Returns whether the outer copy was reloaded.
    fn refresh(&self, key: &EntityKey) -> Result<bool>;

    async fn refresh_async(&self, key: &EntityKey, cancel: &CancellationToken) -> Result<bool>;
}

/// Reloads outer-session entities from the store after an inner commit.
pub struct EntityRefresher<'a> {
    inner: &'a dyn Session,
    outer: &'a dyn Session,
}

impl<'a> EntityRefresher<'a> {
    pub fn new(inner: &'a dyn Session, outer: &'a dyn Session) -> Self {
        Self { inner, outer }
    }

    fn should_refresh(&self, key: &EntityKey) -> bool {
        if self.inner.entry_state(key) == EntryState::Detached {
            return false;
        }
        match self.outer.entry_state(key) {
            EntryState::Unchanged => true,
            EntryState::Detached => false,
            pending => {
                event!(Level::DEBUG, entity = %key, state = ?pending, "outer copy has pending edits; not refreshed");
                false
            }
        }
    }
}

#[async_trait]
impl<'a> EntityRefresh for EntityRefresher<'a> {
    fn refresh(&self, key: &EntityKey) -> Result<bool> {
        if !self.should_refresh(key) {
            return Ok(false);
        }
        self.outer.reload(key)?;
        Ok(true)
    }

    async fn refresh_async(&self, key: &EntityKey, cancel: &CancellationToken) -> Result<bool> {
        if !self.should_refresh(key) {
            return Ok(false);
        }
        self.outer.reload_async(key, cancel).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ScopeError;
    use crate::memory::{MemorySession, MemoryStore};
    use crate::session::Entity;
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ledger {
        id: u32,
        balance: i64,
    }

    impl Entity for Ledger {
        fn id(&self) -> String {
            self.id.to_string()
        }
    }

    fn key() -> EntityKey {
        EntityKey::for_id::<Ledger>("1")
    }

    fn sessions() -> (MemoryStore, MemorySession, MemorySession) {
        let store = MemoryStore::new();
        store.seed(&Ledger { id: 1, balance: 100 }).unwrap();
        let outer = MemorySession::open(&store, false);
        let inner = MemorySession::open(&store, false);
        (store, outer, inner)
    }

    #[test]
    fn test_refresh_reloads_outer_copy_in_place() {
        let (_store, outer, inner) = sessions();
        let outer_copy = outer.set::<Ledger>().find("1").unwrap().unwrap();

        let inner_copy = inner.set::<Ledger>().find("1").unwrap().unwrap();
        inner_copy.write().unwrap().balance = 150;
        inner.save_changes().unwrap();

        let refresher = EntityRefresher::new(&inner, &outer);
        assert!(refresher.refresh(&key()).unwrap());
        assert_eq!(outer_copy.read().unwrap().balance, 150);

        let again = outer.set::<Ledger>().find("1").unwrap().unwrap();
        assert!(Arc::ptr_eq(&outer_copy, &again));
    }

    #[test]
    fn test_refresh_skips_entities_unknown_to_inner() {
        let (_store, outer, inner) = sessions();
        outer.set::<Ledger>().find("1").unwrap().unwrap();

        let refresher = EntityRefresher::new(&inner, &outer);
        assert!(!refresher.refresh(&key()).unwrap());
    }

    #[test]
    fn test_refresh_keeps_pending_outer_edits() {
        let (_store, outer, inner) = sessions();
        let outer_copy = outer.set::<Ledger>().find("1").unwrap().unwrap();
        outer_copy.write().unwrap().balance = 1;

        let inner_copy = inner.set::<Ledger>().find("1").unwrap().unwrap();
        inner_copy.write().unwrap().balance = 150;
        inner.save_changes().unwrap();

        let refresher = EntityRefresher::new(&inner, &outer);
        assert!(!refresher.refresh(&key()).unwrap());
        assert_eq!(outer_copy.read().unwrap().balance, 1);
    }

    #[tokio::test]
    async fn test_refresh_async_honours_cancellation() {
        let (_store, outer, inner) = sessions();
        outer.set::<Ledger>().find("1").unwrap().unwrap();
        inner.set::<Ledger>().find("1").unwrap().unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let refresher = EntityRefresher::new(&inner, &outer);
        assert!(matches!(
            refresher.refresh_async(&key(), &cancel).await,
            Err(ScopeError::Cancelled)
        ));
        assert!(refresher
            .refresh_async(&key(), &CancellationToken::new())
            .await
            .unwrap());
    }
}
