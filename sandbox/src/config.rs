use common::config::SandboxConfig;
use sea_orm::IsolationLevel;

/// Options for one [`TestSandbox`](crate::TestSandbox).
#[derive(Debug, Clone)]
pub struct SandboxOptions {
    /// Isolation level for the sandbox transaction; the engine default when
    /// `None`.
    pub isolation_level: Option<IsolationLevel>,
    /// Take row locks on single-row lookups where the engine supports it.
    pub pessimistic_locks: bool,
}

impl SandboxOptions {
    pub fn with_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    pub fn without_pessimistic_locks(mut self) -> Self {
        self.pessimistic_locks = false;
        self
    }
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            isolation_level: None,
            pessimistic_locks: true,
        }
    }
}

impl From<&SandboxConfig> for SandboxOptions {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            isolation_level: config.isolation_level.map(Into::into),
            pessimistic_locks: config.pessimistic_locks,
        }
    }
}
