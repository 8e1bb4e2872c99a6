// ============================================================================
// dbscope Library
// ============================================================================
//
// Ambient, nestable business-transaction scopes over persistence sessions.
//
// A scope owns (or joins) one session per session type and decides when those
// sessions save. Code further down the call chain finds the current scope
// through the ambient slot instead of taking it as a parameter.
//
// ============================================================================

pub mod ambient;
pub mod collection;
pub mod core;
pub mod locator;
pub mod memory;
pub mod proxy;
pub mod refresh;
pub mod scope;
pub mod session;

pub use crate::core::{InstanceId, IsolationLevel, JoinMode, Result, ScopeError};
pub use ambient::{AmbientSuppressor, flow, flow_blocking, has_ambient_scope, inherit, suppressed};
pub use collection::SessionCollection;
pub use locator::{AmbientScopeLocator, AmbientSessionLocator, SessionMetadata};
pub use proxy::InterceptedSession;
pub use refresh::{EntityRefresh, EntityRefresher};
pub use scope::{
    AmbientScope, ReadOnlyScope, Scope, ScopeDiagnostic, ScopeFactory, ScopeOptions, ScopeStatus,
};
pub use session::{Entity, EntityKey, EntryState, Session, SessionFactory, SessionRequest};
