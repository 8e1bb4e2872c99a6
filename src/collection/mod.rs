// ============================================================================
// Session Collection
// ============================================================================
//
// Lazily creates and owns one session per session type for one non-nested
// scope chain. Only the outermost scope of the chain commits, rolls back or
// disposes it; nested scopes borrow it through a shared `Arc`.
//
// When an isolation level is requested, every session opens an explicit
// transaction at creation time. Commit saves every session first and closes
// the transactions only if all saves succeeded; otherwise all of them are
// rolled back.
//
// ============================================================================

use crate::core::{InstanceId, IsolationLevel, Result, ScopeError};
use crate::session::{Session, SessionFactory, SessionRequest};
use std::any::{Any, TypeId};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{Level, event, info_span};

#[derive(Clone)]
struct SessionEntry {
    type_id: TypeId,
    type_name: &'static str,
    /// Scope whose `get` created the session.
    owner: InstanceId,
    session: Arc<dyn Session>,
    typed: Arc<dyn Any + Send + Sync>,
    in_transaction: bool,
}

#[derive(Default)]
struct CollectionState {
    entries: Vec<SessionEntry>,
    completed: bool,
    disposed: bool,
}

pub struct SessionCollection {
    owner: InstanceId,
    read_only: bool,
    isolation_level: Option<IsolationLevel>,
    factory: SessionFactory,
    state: Mutex<CollectionState>,
}

impl SessionCollection {
    pub fn new(
        owner: InstanceId,
        factory: SessionFactory,
        read_only: bool,
        isolation_level: Option<IsolationLevel>,
    ) -> Self {
        Self {
            owner,
            read_only,
            isolation_level,
            factory,
            state: Mutex::new(CollectionState::default()),
        }
    }

    /// Scope that created this collection.
    pub fn owner(&self) -> InstanceId {
        self.owner
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn isolation_level(&self) -> Option<IsolationLevel> {
        self.isolation_level
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_completed(&self) -> bool {
        self.state.lock().map(|s| s.completed).unwrap_or(false)
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().map(|s| s.disposed).unwrap_or(true)
    }

    /// Returns the cached `S`, creating it through the factory on first use.
    pub fn get_or_create<S: Session>(&self, requester: InstanceId) -> Result<Arc<S>> {
        let mut state = self.state.lock()?;
        if state.disposed {
            return Err(ScopeError::ObjectDisposed("SessionCollection".into()));
        }

        if let Some(entry) = state.entries.iter().find(|e| e.type_id == TypeId::of::<S>()) {
            return Self::downcast::<S>(entry);
        }

        let request = SessionRequest {
            scope_id: self.owner,
            read_only: self.read_only,
        };
        let session: Arc<S> = Arc::new(self.factory.create::<S>(&request)?);

        let mut in_transaction = false;
        if let Some(level) = self.isolation_level {
            session.begin_transaction(level)?;
            in_transaction = true;
        }

        event!(
            Level::DEBUG,
            session_type = std::any::type_name::<S>(),
            requester = %requester,
            "session created"
        );
        state.entries.push(SessionEntry {
            type_id: TypeId::of::<S>(),
            type_name: std::any::type_name::<S>(),
            owner: requester,
            session: session.clone(),
            typed: session.clone(),
            in_transaction,
        });
        Ok(session)
    }

    /// Returns the cached `S` without creating it.
    pub fn get<S: Session>(&self) -> Option<Arc<S>> {
        let state = self.state.lock().ok()?;
        let entry = state.entries.iter().find(|e| e.type_id == TypeId::of::<S>())?;
        Self::downcast::<S>(entry).ok()
    }

    /// Scope that triggered creation of the cached `S`.
    pub fn owner_of<S: Session>(&self) -> Option<InstanceId> {
        let state = self.state.lock().ok()?;
        state
            .entries
            .iter()
            .find(|e| e.type_id == TypeId::of::<S>())
            .map(|e| e.owner)
    }

    /// Every materialized session, in creation order.
    pub(crate) fn initialized(&self) -> Vec<(TypeId, Arc<dyn Session>)> {
        self.state
            .lock()
            .map(|s| {
                s.entries
                    .iter()
                    .map(|e| (e.type_id, e.session.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn session_by_type(&self, type_id: TypeId) -> Option<Arc<dyn Session>> {
        let state = self.state.lock().ok()?;
        state
            .entries
            .iter()
            .find(|e| e.type_id == type_id)
            .map(|e| e.session.clone())
    }

    /// Saves every session and returns the total number of affected rows.
    pub fn commit(&self) -> Result<usize> {
        let entries = self.begin_completion("Commit")?;
        let span = info_span!(
            "scope.collection.commit",
            owner = %self.owner,
            sessions = entries.len(),
            read_only = self.read_only
        );
        let _enter = span.enter();

        let mut affected = 0;
        let mut failure = None;
        if !self.read_only {
            for entry in &entries {
                match entry.session.save_changes() {
                    Ok(count) => affected += count,
                    Err(err) => {
                        event!(Level::ERROR, session_type = entry.type_name, error = %err, "session save failed");
                        failure.get_or_insert(err);
                        if self.isolation_level.is_some() {
                            break;
                        }
                    }
                }
            }
        }

        self.finish_commit(&entries, failure, affected)
    }

    pub async fn commit_async(&self, cancel: &CancellationToken) -> Result<usize> {
        let entries = self.begin_completion("Commit")?;
        let span = info_span!(
            "scope.collection.commit_async",
            owner = %self.owner,
            sessions = entries.len(),
            read_only = self.read_only
        );

        let mut affected = 0;
        let mut failure = None;
        if !self.read_only {
            for entry in &entries {
                if cancel.is_cancelled() {
                    failure.get_or_insert(ScopeError::Cancelled);
                    break;
                }
                match entry.session.save_changes_async(cancel).await {
                    Ok(count) => affected += count,
                    Err(err) => {
                        span.in_scope(|| {
                            event!(Level::ERROR, session_type = entry.type_name, error = %err, "session save failed")
                        });
                        let cancelled = matches!(err, ScopeError::Cancelled);
                        failure.get_or_insert(err);
                        if cancelled || self.isolation_level.is_some() {
                            break;
                        }
                    }
                }
            }
        }

        span.in_scope(|| self.finish_commit(&entries, failure, affected))
    }

    /// Discards pending changes in every session. Failures of individual
    /// sessions are logged and skipped.
    pub fn rollback(&self) -> Result<()> {
        let entries = self.begin_completion("Rollback")?;
        let span = info_span!("scope.collection.rollback", owner = %self.owner, sessions = entries.len());
        let _enter = span.enter();

        for entry in &entries {
            if entry.in_transaction {
                if let Err(err) = entry.session.rollback_transaction() {
                    log::error!(
                        "rolling back transaction failed: session='{}' error='{}'",
                        entry.type_name,
                        err
                    );
                }
            }
            if let Err(err) = entry.session.rollback() {
                log::error!(
                    "rolling back session failed: session='{}' error='{}'",
                    entry.type_name,
                    err
                );
            }
        }

        self.mark_completed()?;
        Ok(())
    }

    /// Releases every session. Uncompleted read-only collections are committed
    /// first, uncompleted read-write ones rolled back.
    pub fn dispose(&self) {
        let (completed, disposed) = match self.state.lock() {
            Ok(state) => (state.completed, state.disposed),
            Err(_) => (false, false),
        };
        if disposed {
            return;
        }

        if !completed {
            let outcome = if self.read_only {
                self.commit().map(|_| ())
            } else {
                self.rollback()
            };
            if let Err(err) = outcome {
                log::error!("Error while disposing scope '{}': {}", self.owner, err);
            }
        }

        let entries = match self.state.lock() {
            Ok(mut state) => {
                state.disposed = true;
                state.completed = true;
                std::mem::take(&mut state.entries)
            }
            Err(err) => {
                log::error!("session collection lock poisoned on dispose: {}", err);
                return;
            }
        };
        for entry in entries {
            entry.session.dispose();
        }
        event!(Level::DEBUG, owner = %self.owner, "session collection disposed");
    }

    fn begin_completion(&self, operation: &str) -> Result<Vec<SessionEntry>> {
        let state = self.state.lock()?;
        if state.disposed {
            return Err(ScopeError::ObjectDisposed("SessionCollection".into()));
        }
        if state.completed {
            return Err(ScopeError::Usage(format!(
                "{}() called more than once on a session collection; a collection can only be committed or rolled back once",
                operation
            )));
        }
        Ok(state.entries.clone())
    }

    fn finish_commit(
        &self,
        entries: &[SessionEntry],
        failure: Option<ScopeError>,
        affected: usize,
    ) -> Result<usize> {
        let mut failure = failure;
        for entry in entries.iter().filter(|e| e.in_transaction) {
            if failure.is_none() {
                if let Err(err) = entry.session.commit_transaction() {
                    event!(Level::ERROR, session_type = entry.type_name, error = %err, "transaction commit failed");
                    failure = Some(err);
                }
            } else if let Err(err) = entry.session.rollback_transaction() {
                log::error!(
                    "rolling back transaction failed: session='{}' error='{}'",
                    entry.type_name,
                    err
                );
            }
        }

        {
            let mut state = self.state.lock()?;
            for entry in state.entries.iter_mut() {
                entry.in_transaction = false;
            }
        }

        match failure {
            Some(err) => Err(err),
            None => {
                self.mark_completed()?;
                event!(Level::DEBUG, affected, "session collection committed");
                Ok(affected)
            }
        }
    }

    fn mark_completed(&self) -> Result<()> {
        let mut state = self.state.lock()?;
        state.completed = true;
        for entry in state.entries.iter_mut() {
            entry.in_transaction = false;
        }
        Ok(())
    }

    fn downcast<S: Session>(entry: &SessionEntry) -> Result<Arc<S>> {
        entry.typed.clone().downcast::<S>().map_err(|_| {
            ScopeError::Usage(format!(
                "cached session is not a '{}'",
                std::any::type_name::<S>()
            ))
        })
    }
}
