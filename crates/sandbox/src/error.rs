/// Contract violations and setup failures. Anything that goes wrong inside a
/// running child is reported through [`crate::ExecFailure`] instead.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("workspace creation failed: {0}")]
    WorkspaceFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
