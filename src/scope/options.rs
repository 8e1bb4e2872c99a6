use crate::core::{IsolationLevel, JoinMode, Result, ScopeError};

pub const ENV_JOIN_MODE: &str = "DBSCOPE_JOIN_MODE";
pub const ENV_READ_ONLY: &str = "DBSCOPE_READ_ONLY";
pub const ENV_ISOLATION_LEVEL: &str = "DBSCOPE_ISOLATION_LEVEL";

/// How a scope should be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScopeOptions {
    /// Join the ambient scope or always start a new session collection.
    pub join_mode: JoinMode,

    /// Read-only scopes never save and are committed implicitly on dispose.
    pub read_only: bool,

    /// Run every session inside an explicit transaction at this level.
    pub isolation_level: Option<IsolationLevel>,
}

impl ScopeOptions {
    /// Read-write scope that joins the ambient scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the join mode
    pub fn join_mode(mut self, join_mode: JoinMode) -> Self {
        self.join_mode = join_mode;
        self
    }

    /// Set the read-only flag
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Request an explicit transaction. Only valid with `ForceCreateNew`.
    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    /// Rejects combinations that cannot be honoured.
    pub fn validate(&self) -> Result<()> {
        if self.isolation_level.is_some() && self.join_mode == JoinMode::JoinExisting {
            return Err(ScopeError::InvalidConfiguration(
                "Cannot join an ambient scope when an explicit database transaction is required. \
                 When an isolation level is set, the join mode must be ForceCreateNew."
                    .into(),
            ));
        }
        Ok(())
    }

    /// Reads `DBSCOPE_JOIN_MODE`, `DBSCOPE_READ_ONLY` and
    /// `DBSCOPE_ISOLATION_LEVEL`; unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut options = Self::new();

        if let Some(join_mode) = lookup(ENV_JOIN_MODE) {
            options.join_mode = join_mode.parse()?;
        }

        if let Some(read_only) = lookup(ENV_READ_ONLY) {
            options.read_only = match read_only.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" | "" => false,
                other => {
                    return Err(ScopeError::InvalidConfiguration(format!(
                        "{} must be a boolean, got '{}'",
                        ENV_READ_ONLY, other
                    )));
                }
            };
        }

        if let Some(level) = lookup(ENV_ISOLATION_LEVEL) {
            if !level.trim().is_empty() {
                options.isolation_level = Some(level.parse()?);
            }
        }

        options.validate()?;
        Ok(options)
    }
}
