// ============================================================================
// In-Memory Sessions
// ============================================================================
//
// A small reference implementation of the session contract: a shared keyed
// store plus a change-tracking session with a first-level cache. Used by the
// tests and the developer tool to drive scopes end to end.
//
// ============================================================================

pub mod session;
pub mod store;

pub use session::{EntityRef, EntitySet, MemorySession};
pub use store::{MemoryStore, Write};
