// ============================================================================
// Ambient Scope Slot
// ============================================================================
//
// Holds the "current" scope of one logical flow of execution. Inside a flow
// started with `flow()` or `inherit()` the slot is task-local, so it follows
// the future across suspension points and worker threads and is invisible to
// other tasks. Outside any flow, and only when no tokio runtime is entered,
// the slot falls back to the current thread for synchronous callers.
//
// Inside a runtime but outside a flow there is no slot at all: tasks sharing
// a worker thread would otherwise see each other's scopes. Nothing is ambient
// there and opening a scope fails with `NoFlowContext`.
//
// ============================================================================

use crate::core::{Result, ScopeError};
use crate::scope::ScopeState;
use std::cell::RefCell;
use std::future::Future;
use std::sync::Arc;

type Slot = RefCell<Option<Arc<ScopeState>>>;

tokio::task_local! {
    static FLOW_SLOT: Slot;
}

thread_local! {
    static THREAD_SLOT: Slot = const { RefCell::new(None) };
}

fn with_slot<R>(op: impl Fn(&Slot) -> R) -> Option<R> {
    if let Ok(result) = FLOW_SLOT.try_with(&op) {
        return Some(result);
    }
    if tokio::runtime::Handle::try_current().is_ok() {
        return None;
    }
    THREAD_SLOT.try_with(&op).ok()
}

/// Fails unless the caller has somewhere to keep an ambient scope.
pub(crate) fn ensure_slot() -> Result<()> {
    with_slot(|_| ()).ok_or(ScopeError::NoFlowContext)
}

pub(crate) fn current() -> Option<Arc<ScopeState>> {
    with_slot(|slot| slot.borrow().clone()).flatten()
}

pub(crate) fn set_current(scope: Option<Arc<ScopeState>>) {
    with_slot(|slot| *slot.borrow_mut() = scope.clone());
}

/// Whether a scope is ambient in the current flow.
pub fn has_ambient_scope() -> bool {
    current().is_some()
}

/// Runs `fut` as an independent flow that starts with no ambient scope.
///
/// Any code that opens scopes inside a tokio runtime must run in a flow,
/// including the body of `#[tokio::main]` and every spawned task.
pub fn flow<F: Future>(fut: F) -> impl Future<Output = F::Output> {
    FLOW_SLOT.scope(RefCell::new(None), fut)
}

/// Synchronous counterpart of [`flow`] for closures run on runtime threads,
/// such as the body of `tokio::task::spawn_blocking`.
pub fn flow_blocking<R>(op: impl FnOnce() -> R) -> R {
    FLOW_SLOT.sync_scope(RefCell::new(None), op)
}

/// Runs `fut` as a new flow that starts with the caller's ambient scope.
///
/// The scope is captured when `inherit` is called, not when the future is
/// first polled. Both flows then share the same sessions, which is only sound
/// if they never use them at the same time.
pub fn inherit<F: Future>(fut: F) -> impl Future<Output = F::Output> {
    FLOW_SLOT.scope(RefCell::new(current()), fut)
}

/// Clears the ambient scope until dropped, then restores it.
///
/// Use around code that starts parallel work which must not join the scope
/// that is currently open.
#[must_use = "the ambient scope is restored as soon as the suppressor is dropped"]
pub struct AmbientSuppressor {
    saved: Option<Arc<ScopeState>>,
}

impl AmbientSuppressor {
    pub fn new() -> Self {
        let saved = current();
        set_current(None);
        Self { saved }
    }

    /// Whether a scope was ambient when the suppressor was created.
    pub fn suppressed_scope(&self) -> bool {
        self.saved.is_some()
    }
}

impl Default for AmbientSuppressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AmbientSuppressor {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            set_current(Some(saved));
        }
    }
}

/// Runs `op` with the ambient scope suppressed.
pub fn suppressed<R>(op: impl FnOnce() -> R) -> R {
    let _suppressor = AmbientSuppressor::new();
    op()
}
