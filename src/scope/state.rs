use super::{ScopeDiagnostic, ScopeOptions};
use crate::ambient;
use crate::collection::SessionCollection;
use crate::core::{InstanceId, IsolationLevel, JoinMode, Result, ScopeError};
use crate::refresh::{EntityRefresh, EntityRefresher};
use crate::session::{EntityKey, Session, SessionFactory};
use std::backtrace::Backtrace;
use std::sync::{Arc, Mutex, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{Level, event, info_span};

const PARENT_DISPOSED_GUIDANCE: &str = "PROGRAMMING ERROR - When attempting to dispose a scope, \
its parent scope had already been disposed. This means that a parallel flow of execution \
(a spawned task, a thread, or a future polled outside its parent's flow) was started while a \
scope was ambient, without suppressing the ambient scope first, and this scope was created in \
that parallel flow.

In order to fix this:
1) Look at the backtrace below: it is the backtrace of the parallel flow in question.
2) Find out where this parallel flow was started.
3) Start it through dbscope::ambient::flow(..), or hold an AmbientSuppressor \
(ScopeFactory::suppress_ambient_context()) while starting it, so it does not capture the \
ambient scope of the flow it branched from.";

/// Lifecycle of a scope. `Disposed` is terminal.
///
/// ```text
/// Active ──commit──> Completed ──dispose──> Disposed
///   │                                          ^
///   └──────────────────dispose─────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeStatus {
    Active,
    Completed,
    Disposed,
}

/// Shared state behind every handle on one scope.
pub(crate) struct ScopeState {
    id: InstanceId,
    join_mode: JoinMode,
    read_only: bool,
    isolation_level: Option<IsolationLevel>,
    /// Joined the ambient scope's collection instead of creating one.
    nested: bool,
    sessions: Arc<SessionCollection>,
    /// Ambient scope observed at construction. Never owns it.
    parent: Option<Weak<ScopeState>>,
    status: Mutex<ScopeStatus>,
    diagnostic: Option<ScopeDiagnostic>,
}

impl ScopeState {
    /// Builds a scope and publishes it as the ambient scope.
    pub(crate) fn open(
        options: &ScopeOptions,
        factory: &SessionFactory,
        diagnostic: Option<ScopeDiagnostic>,
    ) -> Result<Arc<Self>> {
        options.validate()?;
        ambient::ensure_slot()?;

        let id = InstanceId::new();
        let parent = ambient::current();
        let (nested, sessions) = match &parent {
            Some(parent) if options.join_mode == JoinMode::JoinExisting => {
                if parent.read_only && !options.read_only {
                    return Err(ScopeError::InvalidConfiguration(
                        "Cannot nest a read/write scope within a read-only scope".into(),
                    ));
                }
                (true, parent.sessions.clone())
            }
            _ => (
                false,
                Arc::new(SessionCollection::new(
                    id,
                    factory.clone(),
                    options.read_only,
                    options.isolation_level,
                )),
            ),
        };

        let state = Arc::new(Self {
            id,
            join_mode: options.join_mode,
            read_only: options.read_only,
            isolation_level: options.isolation_level,
            nested,
            sessions,
            parent: parent.as_ref().map(Arc::downgrade),
            status: Mutex::new(ScopeStatus::Active),
            diagnostic,
        });

        ambient::set_current(Some(state.clone()));
        event!(
            Level::DEBUG,
            scope = %id,
            nested,
            read_only = options.read_only,
            "scope opened"
        );
        Ok(state)
    }

    pub(crate) fn id(&self) -> InstanceId {
        self.id
    }

    pub(crate) fn join_mode(&self) -> JoinMode {
        self.join_mode
    }

    pub(crate) fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub(crate) fn isolation_level(&self) -> Option<IsolationLevel> {
        self.isolation_level
    }

    pub(crate) fn is_nested(&self) -> bool {
        self.nested
    }

    pub(crate) fn sessions(&self) -> &Arc<SessionCollection> {
        &self.sessions
    }

    pub(crate) fn parent_id(&self) -> Option<InstanceId> {
        self.parent.as_ref().and_then(Weak::upgrade).map(|p| p.id)
    }

    pub(crate) fn status(&self) -> ScopeStatus {
        self.status
            .lock()
            .map(|s| *s)
            .unwrap_or(ScopeStatus::Disposed)
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.status() == ScopeStatus::Disposed
    }

    fn set_status(&self, status: ScopeStatus) -> Result<()> {
        *self.status.lock()? = status;
        Ok(())
    }

    fn record(&self, method: &str) {
        if let Some(diagnostic) = &self.diagnostic {
            diagnostic.record(method);
        }
    }

    pub(crate) fn get<S: Session>(&self) -> Result<Arc<S>> {
        if self.is_disposed() {
            return Err(ScopeError::ObjectDisposed("Scope".into()));
        }
        self.sessions.get_or_create::<S>(self.id)
    }

    fn ensure_can_commit(&self) -> Result<()> {
        if self.read_only {
            return Err(ScopeError::ReadOnlyAmbientScope);
        }
        match self.status() {
            ScopeStatus::Disposed => Err(ScopeError::ObjectDisposed("Scope".into())),
            ScopeStatus::Completed => Err(ScopeError::AlreadyCompleted),
            ScopeStatus::Active => Ok(()),
        }
    }

    /// Commits the collection unless nested; the outermost scope owns the
    /// real commit.
    pub(crate) fn commit(&self) -> Result<usize> {
        self.ensure_can_commit()?;
        self.record("SaveChanges");

        let affected = if self.nested {
            0
        } else {
            self.sessions.commit()?
        };
        self.set_status(ScopeStatus::Completed)?;
        Ok(affected)
    }

    pub(crate) async fn commit_async(&self, cancel: &CancellationToken) -> Result<usize> {
        self.ensure_can_commit()?;
        self.record("SaveChangesAsync");

        let affected = if self.nested {
            0
        } else {
            self.sessions.commit_async(cancel).await?
        };
        self.set_status(ScopeStatus::Completed)?;
        Ok(affected)
    }

    /// Parent scope to refresh, or `None` when there is nothing to do.
    fn refresh_target(&self, entities: &[EntityKey], method: &str) -> Option<Arc<ScopeState>> {
        let parent = if entities.is_empty() || self.nested {
            None
        } else {
            self.parent.as_ref().and_then(Weak::upgrade)
        };

        match parent {
            Some(parent) => {
                self.record(method);
                Some(parent)
            }
            None => {
                self.record(&format!("{}-SKIP", method));
                None
            }
        }
    }

    /// Pairs each of our sessions with the parent's session of the same type.
    fn session_pairs(&self, parent: &ScopeState) -> Vec<(Arc<dyn Session>, Arc<dyn Session>)> {
        self.sessions
            .initialized()
            .into_iter()
            .filter_map(|(type_id, inner)| {
                parent
                    .sessions
                    .session_by_type(type_id)
                    .map(|outer| (inner, outer))
            })
            .collect()
    }

    /// Pushes the committed state of `entities` into the parent scope's
    /// same-typed sessions.
    pub(crate) fn refresh_in_parent(&self, entities: &[EntityKey]) -> Result<()> {
        let Some(parent) = self.refresh_target(entities, "RefreshEntitiesInParentScope") else {
            return Ok(());
        };
        let span = info_span!(
            "scope.refresh_in_parent",
            scope = %self.id,
            parent = %parent.id,
            entities = entities.len()
        );
        let _enter = span.enter();

        let mut refreshed = 0;
        for (inner, outer) in self.session_pairs(&parent) {
            let refresher = EntityRefresher::new(inner.as_ref(), outer.as_ref());
            for key in entities {
                if refresher.refresh(key)? {
                    refreshed += 1;
                }
            }
        }
        event!(Level::DEBUG, refreshed, "parent scope refreshed");
        Ok(())
    }

    pub(crate) async fn refresh_in_parent_async(
        &self,
        entities: &[EntityKey],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(parent) = self.refresh_target(entities, "RefreshEntitiesInParentScopeAsync")
        else {
            return Ok(());
        };

        for (inner, outer) in self.session_pairs(&parent) {
            let refresher = EntityRefresher::new(inner.as_ref(), outer.as_ref());
            for key in entities {
                refresher.refresh_async(key, cancel).await?;
            }
        }
        Ok(())
    }

    /// Completes and releases the scope, then restores its parent as the
    /// ambient scope. Idempotent.
    pub(crate) fn dispose(self: &Arc<Self>) -> Result<()> {
        let status = self.status();
        if status == ScopeStatus::Disposed {
            return Ok(());
        }
        self.record("Dispose");

        if !self.nested {
            if status == ScopeStatus::Active && !self.read_only {
                log::warn!(
                    "The read/write scope '{}' was disposed without calling commit; rolling back its changes",
                    self.id
                );
            }
            // Commits (read-only) or rolls back (read/write) whatever was not
            // completed yet, logging failures. Runs at most once.
            self.sessions.dispose();
        }
        self.set_status(ScopeStatus::Completed)?;

        let is_ambient = ambient::current().is_some_and(|current| Arc::ptr_eq(&current, self));
        if !is_ambient {
            self.set_status(ScopeStatus::Disposed)?;
            return Err(ScopeError::OutOfOrderDisposal);
        }
        ambient::set_current(None);

        let outcome = match &self.parent {
            None => Ok(()),
            Some(parent) => match parent.upgrade() {
                Some(parent) if !parent.is_disposed() => {
                    ambient::set_current(Some(parent));
                    Ok(())
                }
                _ => Err(ScopeError::ParentScopeDisposed(format!(
                    "{}\n\nBacktrace:\n{}",
                    PARENT_DISPOSED_GUIDANCE,
                    Backtrace::capture()
                ))),
            },
        };

        self.set_status(ScopeStatus::Disposed)?;
        event!(Level::DEBUG, scope = %self.id, "scope disposed");
        outcome
    }

    /// Disposal from `Drop`: protocol violations cannot be returned, so they
    /// are raised unless the thread is already unwinding.
    pub(crate) fn dispose_on_drop(self: &Arc<Self>) {
        if let Err(err) = self.dispose() {
            log::error!("{}", err);
            if err.is_protocol_violation() && !std::thread::panicking() {
                panic!("{}", err);
            }
        }
    }
}
