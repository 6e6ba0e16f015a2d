mod config;
mod error;
mod sandbox;
mod types;
mod validate;

pub use config::{
    DEFAULT_ALLOWED_EXTENSIONS, DEFAULT_KILL_GRACE, DEFAULT_MAX_CPU_PERCENT,
    DEFAULT_MAX_EXECUTION_TIME, DEFAULT_MAX_FILE_SIZE, DEFAULT_MAX_MEMORY_MB,
    DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_SAMPLE_INTERVAL, FilePolicy, ResourceLimits, SandboxConfig,
    duration_from_secs,
};
pub use error::{Result, SandboxError};
pub use sandbox::Sandbox;
pub use types::{
    Ceiling, Cleanup, ExecFailure, ExecRequest, ExecutionResult, ResourceSnapshot, SecurityMode,
};
pub use validate::{
    LARGE_IMAGE_THRESHOLD, PREFIX_LEN, Rejection, RiskLevel, SignatureCheck, ValidationResult,
    human_size, validate_file,
};
