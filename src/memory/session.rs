use super::store::{MemoryStore, Write};
use crate::core::{IsolationLevel, Result, ScopeError};
use crate::session::{Entity, EntityKey, EntryState, Session};
use async_trait::async_trait;
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// Shared handle on a cached entity. Every reader of the same session sees the
/// same allocation, so in-place refreshes are observed by all holders.
pub type EntityRef<E> = Arc<RwLock<E>>;

trait TrackedEntity: Send + Sync {
    fn snapshot(&self) -> Result<Value>;
    fn overwrite(&self, value: Value) -> Result<()>;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<E: Entity> TrackedEntity for RwLock<E> {
    fn snapshot(&self) -> Result<Value> {
        let entity = self.read()?;
        Ok(serde_json::to_value(&*entity)?)
    }

    fn overwrite(&self, value: Value) -> Result<()> {
        let fresh: E = serde_json::from_value(value)?;
        *self.write()? = fresh;
        Ok(())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

struct TrackedEntry {
    entity: Arc<dyn TrackedEntity>,
    /// Values as last loaded or saved; `None` for entries added in this session.
    original: Option<Value>,
    state: EntryState,
}

impl TrackedEntry {
    /// Promotes `Unchanged` to `Modified` when the live values drifted from
    /// the snapshot.
    fn detect_change(&mut self) -> Result<()> {
        if self.state == EntryState::Unchanged {
            let current = self.entity.snapshot()?;
            if self.original.as_ref() != Some(&current) {
                self.state = EntryState::Modified;
            }
        }
        Ok(())
    }
}

struct PendingTransaction {
    isolation: IsolationLevel,
    writes: Vec<Write>,
}

#[derive(Default)]
struct SessionState {
    entries: BTreeMap<EntityKey, TrackedEntry>,
    transaction: Option<PendingTransaction>,
    disposed: bool,
}

impl SessionState {
    fn ensure_open(&self) -> Result<()> {
        if self.disposed {
            return Err(ScopeError::ObjectDisposed("MemorySession".into()));
        }
        Ok(())
    }

    fn detect_changes(&mut self) -> Result<()> {
        for entry in self.entries.values_mut() {
            entry.detect_change()?;
        }
        Ok(())
    }
}

/// In-memory session over a [`MemoryStore`].
///
/// `M` is a marker that makes otherwise identical sessions distinct types, so
/// one scope can hold several of them side by side.
pub struct MemorySession<M: 'static = ()> {
    store: MemoryStore,
    read_only: bool,
    state: Mutex<SessionState>,
    _marker: PhantomData<fn() -> M>,
}

impl<M: 'static> MemorySession<M> {
    /// Opens a session. Read-only sessions do not track what they load.
    pub fn open(store: &MemoryStore, read_only: bool) -> Self {
        Self {
            store: store.clone(),
            read_only,
            state: Mutex::new(SessionState::default()),
            _marker: PhantomData,
        }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().map(|s| s.disposed).unwrap_or(true)
    }

    pub fn tracked_count(&self) -> Result<usize> {
        Ok(self.state.lock()?.entries.len())
    }

    pub fn transaction_isolation(&self) -> Result<Option<IsolationLevel>> {
        Ok(self.state.lock()?.transaction.as_ref().map(|t| t.isolation))
    }

    /// Entity collection of type `E` in this session.
    pub fn set<E: Entity>(&self) -> EntitySet<'_, E, M> {
        EntitySet {
            session: self,
            _entity: PhantomData,
        }
    }

    fn pending_writes(state: &mut SessionState) -> Result<Vec<Write>> {
        state.detect_changes()?;
        let mut writes = Vec::new();
        for (key, entry) in &state.entries {
            match entry.state {
                EntryState::Added => writes.push(Write::Insert {
                    key: key.clone(),
                    value: entry.entity.snapshot()?,
                }),
                EntryState::Modified => writes.push(Write::Update {
                    key: key.clone(),
                    value: entry.entity.snapshot()?,
                }),
                EntryState::Deleted => writes.push(Write::Delete { key: key.clone() }),
                EntryState::Unchanged | EntryState::Detached => {}
            }
        }
        Ok(writes)
    }

    /// Marks every written entry as persisted.
    fn accept_changes(state: &mut SessionState, writes: &[Write]) {
        for write in writes {
            match write {
                Write::Insert { key, value } | Write::Update { key, value } => {
                    if let Some(entry) = state.entries.get_mut(key) {
                        entry.original = Some(value.clone());
                        entry.state = EntryState::Unchanged;
                    }
                }
                Write::Delete { key } => {
                    state.entries.remove(key);
                }
            }
        }
    }

    fn tracked<E: Entity>(entry: &TrackedEntry) -> Result<EntityRef<E>> {
        entry
            .entity
            .clone()
            .into_any()
            .downcast::<RwLock<E>>()
            .map_err(|_| {
                ScopeError::Usage(format!(
                    "cached entry is not a '{}'",
                    std::any::type_name::<E>()
                ))
            })
    }
}

impl<M: 'static> Default for MemorySession<M> {
    fn default() -> Self {
        Self::open(&MemoryStore::new(), false)
    }
}

#[async_trait]
impl<M: 'static> Session for MemorySession<M> {
    fn save_changes(&self) -> Result<usize> {
        let mut state = self.state.lock()?;
        state.ensure_open()?;
        if self.read_only {
            return Ok(0);
        }

        let writes = Self::pending_writes(&mut state)?;
        let affected = writes.len();
        match state.transaction.as_mut() {
            Some(transaction) => transaction.writes.extend(writes.iter().cloned()),
            None => {
                self.store.apply(&writes)?;
            }
        }

        Self::accept_changes(&mut state, &writes);
        Ok(affected)
    }

    async fn save_changes_async(&self, cancel: &CancellationToken) -> Result<usize> {
        tokio::task::yield_now().await;
        if cancel.is_cancelled() {
            return Err(ScopeError::Cancelled);
        }
        self.save_changes()
    }

    fn rollback(&self) -> Result<()> {
        let mut state = self.state.lock()?;
        let mut discarded = Vec::new();
        for (key, entry) in state.entries.iter_mut() {
            if entry.state == EntryState::Added {
                discarded.push(key.clone());
            } else if let Some(original) = entry.original.clone() {
                entry.entity.overwrite(original)?;
                entry.state = EntryState::Unchanged;
            }
        }
        for key in discarded {
            state.entries.remove(&key);
        }
        Ok(())
    }

    fn dispose(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.entries.clear();
            state.transaction = None;
            state.disposed = true;
        }
    }

    fn begin_transaction(&self, isolation: IsolationLevel) -> Result<()> {
        let mut state = self.state.lock()?;
        state.ensure_open()?;
        if state.transaction.is_some() {
            return Err(ScopeError::Usage("Transaction already active".into()));
        }
        state.transaction = Some(PendingTransaction {
            isolation,
            writes: Vec::new(),
        });
        Ok(())
    }

    fn commit_transaction(&self) -> Result<()> {
        let transaction = self
            .state
            .lock()?
            .transaction
            .take()
            .ok_or_else(|| ScopeError::Usage("No active transaction".into()))?;
        self.store.apply(&transaction.writes)?;
        Ok(())
    }

    fn rollback_transaction(&self) -> Result<()> {
        self.state
            .lock()?
            .transaction
            .take()
            .map(|_| ())
            .ok_or_else(|| ScopeError::Usage("No active transaction".into()))
    }

    fn entry_state(&self, key: &EntityKey) -> EntryState {
        let Ok(mut state) = self.state.lock() else {
            return EntryState::Detached;
        };
        match state.entries.get_mut(key) {
            Some(entry) => match entry.detect_change() {
                Ok(()) => entry.state,
                Err(_) => EntryState::Modified,
            },
            None => EntryState::Detached,
        }
    }

    fn changed_entities(&self) -> Vec<EntityKey> {
        let Ok(mut state) = self.state.lock() else {
            return Vec::new();
        };
        if state.detect_changes().is_err() {
            return Vec::new();
        }
        state
            .entries
            .iter()
            .filter(|(_, entry)| entry.state.is_pending())
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn reload(&self, key: &EntityKey) -> Result<()> {
        let fresh = self.store.get(key)?;
        let mut state = self.state.lock()?;
        state.ensure_open()?;
        match fresh {
            Some(value) => {
                let entry = state
                    .entries
                    .get_mut(key)
                    .ok_or_else(|| ScopeError::Usage(format!("{} is not tracked", key)))?;
                entry.entity.overwrite(value.clone())?;
                entry.original = Some(value);
                entry.state = EntryState::Unchanged;
            }
            None => {
                state.entries.remove(key);
            }
        }
        Ok(())
    }

    async fn reload_async(&self, key: &EntityKey, cancel: &CancellationToken) -> Result<()> {
        tokio::task::yield_now().await;
        if cancel.is_cancelled() {
            return Err(ScopeError::Cancelled);
        }
        self.reload(key)
    }
}

/// Typed view over the entities of type `E` in one session.
pub struct EntitySet<'a, E: Entity, M: 'static> {
    session: &'a MemorySession<M>,
    _entity: PhantomData<fn() -> E>,
}

impl<'a, E: Entity, M: 'static> EntitySet<'a, E, M> {
    /// Returns the cached instance if tracked, otherwise loads it from the store.
    pub fn find(&self, id: &str) -> Result<Option<EntityRef<E>>> {
        let key = EntityKey::for_id::<E>(id);
        {
            let state = self.session.state.lock()?;
            state.ensure_open()?;
            if let Some(entry) = state.entries.get(&key) {
                if entry.state == EntryState::Deleted {
                    return Ok(None);
                }
                return MemorySession::<M>::tracked::<E>(entry).map(Some);
            }
        }

        let Some(value) = self.session.store.get(&key)? else {
            return Ok(None);
        };
        let entity: EntityRef<E> = Arc::new(RwLock::new(serde_json::from_value(value.clone())?));
        if self.session.read_only {
            return Ok(Some(entity));
        }

        let mut state = self.session.state.lock()?;
        // Another caller may have loaded it while the store was read.
        if let Some(entry) = state.entries.get(&key) {
            return MemorySession::<M>::tracked::<E>(entry).map(Some);
        }
        state.entries.insert(
            key,
            TrackedEntry {
                entity: entity.clone(),
                original: Some(value),
                state: EntryState::Unchanged,
            },
        );
        Ok(Some(entity))
    }

    /// Starts tracking a new entity; it is inserted on the next save.
    pub fn add(&self, entity: E) -> Result<EntityRef<E>> {
        if self.session.read_only {
            return Err(ScopeError::Usage(
                "cannot add entities through a read-only session".into(),
            ));
        }
        let key = EntityKey::of(&entity);
        let mut state = self.session.state.lock()?;
        state.ensure_open()?;
        if state.entries.contains_key(&key) {
            return Err(ScopeError::Usage(format!("{} is already tracked", key)));
        }

        let entity: EntityRef<E> = Arc::new(RwLock::new(entity));
        state.entries.insert(
            key,
            TrackedEntry {
                entity: entity.clone(),
                original: None,
                state: EntryState::Added,
            },
        );
        Ok(entity)
    }

    /// Marks a tracked entity for deletion.
    pub fn remove(&self, entity: &EntityRef<E>) -> Result<()> {
        let key = EntityKey::of(&*entity.read()?);
        let mut state = self.session.state.lock()?;
        state.ensure_open()?;
        let added = match state.entries.get_mut(&key) {
            Some(entry) if entry.state == EntryState::Added => true,
            Some(entry) => {
                entry.state = EntryState::Deleted;
                false
            }
            None => return Err(ScopeError::Usage(format!("{} is not tracked", key))),
        };
        if added {
            state.entries.remove(&key);
        }
        Ok(())
    }

    /// Every committed entity of type `E`, resolved through the cache.
    pub fn all(&self) -> Result<Vec<EntityRef<E>>> {
        let mut entities = Vec::new();
        for key in self.session.store.keys_of(E::entity_name())? {
            if let Some(entity) = self.find(&key.id)? {
                entities.push(entity);
            }
        }
        Ok(entities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

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

    fn ledger(id: u32, balance: i64) -> Ledger {
        Ledger { id, balance }
    }

    #[test]
    fn test_add_and_save() {
        let store = MemoryStore::new();
        let session = MemorySession::<()>::open(&store, false);
        session.set::<Ledger>().add(ledger(1, 100)).unwrap();

        assert_eq!(session.save_changes().unwrap(), 1);
        assert_eq!(store.load::<Ledger>("1").unwrap(), Some(ledger(1, 100)));
        assert_eq!(session.save_changes().unwrap(), 0);
    }

    #[test]
    fn test_find_returns_cached_identity() {
        let store = MemoryStore::new();
        store.seed(&ledger(1, 100)).unwrap();
        let session = MemorySession::<()>::open(&store, false);

        let first = session.set::<Ledger>().find("1").unwrap().unwrap();
        let second = session.set::<Ledger>().find("1").unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_snapshot_change_detection() {
        let store = MemoryStore::new();
        store.seed(&ledger(1, 100)).unwrap();
        let session = MemorySession::<()>::open(&store, false);
        let key = EntityKey::for_id::<Ledger>("1");

        let entity = session.set::<Ledger>().find("1").unwrap().unwrap();
        assert_eq!(session.entry_state(&key), EntryState::Unchanged);

        entity.write().unwrap().balance = 150;
        assert_eq!(session.entry_state(&key), EntryState::Modified);
        assert_eq!(session.changed_entities(), vec![key]);
        assert_eq!(session.save_changes().unwrap(), 1);
        assert_eq!(store.load::<Ledger>("1").unwrap().unwrap().balance, 150);
    }

    #[test]
    fn test_rollback_restores_original_values() {
        let store = MemoryStore::new();
        store.seed(&ledger(1, 100)).unwrap();
        let session = MemorySession::<()>::open(&store, false);

        let entity = session.set::<Ledger>().find("1").unwrap().unwrap();
        entity.write().unwrap().balance = 0;
        session.set::<Ledger>().add(ledger(2, 5)).unwrap();

        session.rollback().unwrap();
        assert_eq!(entity.read().unwrap().balance, 100);
        assert!(session.changed_entities().is_empty());
        assert_eq!(session.tracked_count().unwrap(), 1);
    }

    #[test]
    fn test_transaction_stages_writes_until_commit() {
        let store = MemoryStore::new();
        let session = MemorySession::<()>::open(&store, false);
        session.begin_transaction(IsolationLevel::Serializable).unwrap();
        assert_eq!(
            session.transaction_isolation().unwrap(),
            Some(IsolationLevel::Serializable)
        );

        session.set::<Ledger>().add(ledger(1, 10)).unwrap();
        assert_eq!(session.save_changes().unwrap(), 1);
        assert!(store.is_empty().unwrap());

        session.commit_transaction().unwrap();
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_rollback_transaction_discards_staged_writes() {
        let store = MemoryStore::new();
        let session = MemorySession::<()>::open(&store, false);
        session.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
        session.set::<Ledger>().add(ledger(1, 10)).unwrap();
        session.save_changes().unwrap();

        session.rollback_transaction().unwrap();
        assert!(store.is_empty().unwrap());
        assert!(session.commit_transaction().is_err());
    }

    #[test]
    fn test_reload_keeps_identity() {
        let store = MemoryStore::new();
        store.seed(&ledger(1, 100)).unwrap();
        let session = MemorySession::<()>::open(&store, false);
        let entity = session.set::<Ledger>().find("1").unwrap().unwrap();

        store.seed(&ledger(1, 250)).unwrap();
        session.reload(&EntityKey::for_id::<Ledger>("1")).unwrap();

        assert_eq!(entity.read().unwrap().balance, 250);
        let again = session.set::<Ledger>().find("1").unwrap().unwrap();
        assert!(Arc::ptr_eq(&entity, &again));
    }

    #[test]
    fn test_read_only_session_does_not_track() {
        let store = MemoryStore::new();
        store.seed(&ledger(1, 100)).unwrap();
        let session = MemorySession::<()>::open(&store, true);

        let first = session.set::<Ledger>().find("1").unwrap().unwrap();
        let second = session.set::<Ledger>().find("1").unwrap().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(session.tracked_count().unwrap(), 0);
        assert!(session.set::<Ledger>().add(ledger(2, 1)).is_err());
    }

    #[test]
    fn test_remove_and_save_deletes_row() {
        let store = MemoryStore::new();
        store.seed(&ledger(1, 100)).unwrap();
        let session = MemorySession::<()>::open(&store, false);
        let entity = session.set::<Ledger>().find("1").unwrap().unwrap();

        session.set::<Ledger>().remove(&entity).unwrap();
        assert!(session.set::<Ledger>().find("1").unwrap().is_none());
        assert_eq!(session.save_changes().unwrap(), 1);
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_disposed_session_rejects_work() {
        let session = MemorySession::<()>::default();
        session.dispose();
        assert!(session.is_disposed());
        assert!(matches!(
            session.save_changes(),
            Err(ScopeError::ObjectDisposed(_))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_async_save() {
        let session = MemorySession::<()>::default();
        session.set::<Ledger>().add(ledger(1, 1)).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = session.save_changes_async(&cancel).await.unwrap_err();
        assert!(matches!(err, ScopeError::Cancelled));
        assert_eq!(session.changed_entities().len(), 1);
    }
}
