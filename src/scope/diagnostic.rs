use std::sync::{Arc, Mutex};

/// Records which lifecycle methods were called on scopes, for tests and
/// troubleshooting. Purely observational.
#[derive(Debug, Clone, Default)]
pub struct ScopeDiagnostic {
    called: Arc<Mutex<Vec<String>>>,
}

impl ScopeDiagnostic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, method: &str) {
        if let Ok(mut called) = self.called.lock() {
            called.push(method.to_string());
        }
    }

    pub fn called_methods(&self) -> Vec<String> {
        self.called.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn count(&self, method: &str) -> usize {
        self.called
            .lock()
            .map(|c| c.iter().filter(|m| *m == method).count())
            .unwrap_or(0)
    }

    pub fn clear(&self) {
        if let Ok(mut called) = self.called.lock() {
            called.clear();
        }
    }
}
