#![allow(dead_code)]

use dbscope::memory::{MemorySession, MemoryStore};
use dbscope::{Entity, ScopeDiagnostic, ScopeFactory, SessionFactory, SessionRequest};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, Once};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
    pub id: u32,
    pub balance: i64,
}

impl Entity for Ledger {
    fn id(&self) -> String {
        self.id.to_string()
    }

    fn entity_name() -> &'static str {
        "ledger"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: u32,
    pub message: String,
}

impl Entity for AuditEntry {
    fn id(&self) -> String {
        self.id.to_string()
    }

    fn entity_name() -> &'static str {
        "audit"
    }
}

pub struct Accounting;
pub struct Audit;

pub type LedgerSession = MemorySession<Accounting>;
pub type AuditSession = MemorySession<Audit>;

pub fn session_factory(store: &MemoryStore) -> SessionFactory {
    let ledger_store = store.clone();
    let audit_store = store.clone();
    SessionFactory::new()
        .register(move |req: &SessionRequest| Ok(LedgerSession::open(&ledger_store, req.read_only)))
        .register(move |req: &SessionRequest| Ok(AuditSession::open(&audit_store, req.read_only)))
}

pub fn scope_factory(store: &MemoryStore) -> ScopeFactory {
    ScopeFactory::new(session_factory(store))
}

pub fn traced_scope_factory(store: &MemoryStore) -> (ScopeFactory, ScopeDiagnostic) {
    let diagnostic = ScopeDiagnostic::new();
    let factory = scope_factory(store).with_diagnostic(diagnostic.clone());
    (factory, diagnostic)
}

pub fn seeded_store(balance: i64) -> MemoryStore {
    let store = MemoryStore::new();
    store.seed(&Ledger { id: 1, balance }).unwrap();
    store
}

/// Log records captured by [`capture_logs`], shared by every test in the binary.
static RECORDS: Mutex<Vec<(log::Level, String)>> = Mutex::new(Vec::new());

struct CapturingLogger;

impl log::Log for CapturingLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Warn
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            if let Ok(mut records) = RECORDS.lock() {
                records.push((record.level(), record.args().to_string()));
            }
        }
    }

    fn flush(&self) {}
}

static LOGGER: CapturingLogger = CapturingLogger;

/// Installs the capturing logger once per test binary.
pub fn capture_logs() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(log::LevelFilter::Warn);
        }
    });
}

/// Captured messages at `level` that mention every one of `needles`.
/// Tests run in parallel, so callers filter by something unique such as a
/// scope id.
pub fn logged(level: log::Level, needles: &[&str]) -> Vec<String> {
    RECORDS
        .lock()
        .unwrap()
        .iter()
        .filter(|(l, message)| *l == level && needles.iter().all(|n| message.contains(n)))
        .map(|(_, message)| message.clone())
        .collect()
}
