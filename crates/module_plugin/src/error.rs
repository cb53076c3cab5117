use thiserror::Error;

/// Errors a module reports back to the host.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("initialization failed: {0}")]
    Initialization(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("tick failed: {0}")]
    Tick(String),

    #[error("shutdown failed: {0}")]
    Shutdown(String),

    #[error("invalid input on port `{port}`: {reason}")]
    InvalidInput { port: String, reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
