// ============================================================================
// Scopes
// ============================================================================
//
// A scope is one business transaction. Scopes nest: opening a scope with
// `JoinMode::JoinExisting` while another is ambient reuses the ambient scope's
// sessions, and only the outermost scope actually commits. Opening with
// `JoinMode::ForceCreateNew` (or with an isolation level) starts an independent
// chain with its own sessions.
//
// Scopes must be disposed in the reverse order of their creation within a
// flow. `Scope` and `ReadOnlyScope` dispose themselves when dropped.
//
// ============================================================================

pub mod diagnostic;
pub mod factory;
pub mod handle;
pub mod options;
pub mod read_only;
pub mod read_write;
mod state;

pub use diagnostic::ScopeDiagnostic;
pub use factory::ScopeFactory;
pub use handle::AmbientScope;
pub use options::ScopeOptions;
pub use read_only::ReadOnlyScope;
pub use read_write::Scope;
pub(crate) use state::ScopeState;
pub use state::ScopeStatus;
