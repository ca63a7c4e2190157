use thiserror::Error;

use crate::settings::InterfaceRole;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Invalid configuration: {0}")]
    Validation(String),

    #[error("Command '{0}' not found")]
    CommandNotFound(String),

    #[error("Command '{command}' timed out after {seconds}s")]
    CommandTimeout { command: String, seconds: u64 },

    #[error("Failed to execute command '{command}': {detail}")]
    Execution { command: String, detail: String },

    #[error("Helper '{helper}' failed: {stderr}")]
    Apply { helper: String, stderr: String },

    #[error("Verification timed out: {0}")]
    VerificationTimeout(String),

    #[error("Rollback failed, manual intervention required: {0}")]
    RollbackFailure(String),

    #[error("An apply for {0} is already in progress")]
    Busy(InterfaceRole),

    #[error("Config I/O error: {0}")]
    ConfigIo(String),
}
