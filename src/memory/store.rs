use crate::core::{Result, ScopeError};
use crate::session::{Entity, EntityKey};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// One row-level write produced by a session save.
#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    Insert { key: EntityKey, value: Value },
    Update { key: EntityKey, value: Value },
    Delete { key: EntityKey },
}

impl Write {
    pub fn key(&self) -> &EntityKey {
        match self {
            Write::Insert { key, .. } => key,
            Write::Update { key, .. } => key,
            Write::Delete { key } => key,
        }
    }
}

#[derive(Default)]
struct StoreState {
    rows: BTreeMap<EntityKey, Value>,
    fail_next_write: Option<String>,
    applied_batches: u64,
}

/// Shared in-memory backing store for [`MemorySession`](super::MemorySession).
///
/// Cloning yields another handle on the same rows. A batch of writes is
/// applied atomically: either every write lands or none does.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<StoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a row directly, bypassing any session.
    pub fn seed<E: Entity>(&self, entity: &E) -> Result<()> {
        let value = serde_json::to_value(entity)?;
        let mut state = self.state.write()?;
        state.rows.insert(EntityKey::of(entity), value);
        Ok(())
    }

    pub fn get(&self, key: &EntityKey) -> Result<Option<Value>> {
        let state = self.state.read()?;
        Ok(state.rows.get(key).cloned())
    }

    /// Typed read of a committed row.
    pub fn load<E: Entity>(&self, id: &str) -> Result<Option<E>> {
        match self.get(&EntityKey::for_id::<E>(id))? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub fn contains(&self, key: &EntityKey) -> Result<bool> {
        Ok(self.state.read()?.rows.contains_key(key))
    }

    /// Keys of every committed row of one entity type.
    pub fn keys_of(&self, entity: &str) -> Result<Vec<EntityKey>> {
        let state = self.state.read()?;
        Ok(state
            .rows
            .keys()
            .filter(|key| key.entity == entity)
            .cloned()
            .collect())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.state.read()?.rows.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Number of write batches applied so far.
    pub fn applied_batches(&self) -> Result<u64> {
        Ok(self.state.read()?.applied_batches)
    }

    /// Makes the next non-empty batch fail with `reason`, as a store would on
    /// a deadlock or lost connection.
    pub fn fail_next_write(&self, reason: &str) -> Result<()> {
        self.state.write()?.fail_next_write = Some(reason.to_string());
        Ok(())
    }

    /// Applies `writes` atomically and returns the number of affected rows.
    pub fn apply(&self, writes: &[Write]) -> Result<usize> {
        if writes.is_empty() {
            return Ok(0);
        }

        let mut state = self.state.write()?;
        if let Some(reason) = state.fail_next_write.take() {
            return Err(ScopeError::Persistence(reason));
        }

        // Validate against the rows as they will be after each preceding write
        // of the same batch.
        let mut staged = state.rows.clone();
        for write in writes {
            match write {
                Write::Insert { key, value } => {
                    if staged.contains_key(key) {
                        return Err(ScopeError::Persistence(format!(
                            "unique constraint violated for {}",
                            key
                        )));
                    }
                    staged.insert(key.clone(), value.clone());
                }
                Write::Update { key, value } => {
                    if !staged.contains_key(key) {
                        return Err(ScopeError::Persistence(format!(
                            "row {} no longer exists",
                            key
                        )));
                    }
                    staged.insert(key.clone(), value.clone());
                }
                Write::Delete { key } => {
                    if staged.remove(key).is_none() {
                        return Err(ScopeError::Persistence(format!(
                            "row {} no longer exists",
                            key
                        )));
                    }
                }
            }
        }

        state.rows = staged;
        state.applied_batches += 1;
        Ok(writes.len())
    }
}
