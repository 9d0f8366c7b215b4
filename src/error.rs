use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable machine codes carried on every user-visible failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "VALIDATION_ERROR")]
    Validation,
    #[serde(rename = "TOOL_NOT_FOUND")]
    ToolNotFound,
    #[serde(rename = "TOOL_OPERATION_NOT_FOUND")]
    ToolOperationNotFound,
    #[serde(rename = "EXECUTION_ERROR")]
    Execution,
    #[serde(rename = "TIMEOUT_ERROR")]
    Timeout,
    #[serde(rename = "CANCELLED")]
    Cancelled,
    #[serde(rename = "RESOURCE_EXHAUSTED")]
    ResourceExhausted,
    #[serde(rename = "PLANNING_ERROR")]
    Planning,
    #[serde(rename = "RECOVERY_EXHAUSTED")]
    RecoveryExhausted,
    #[serde(rename = "LLM_ERROR")]
    Llm,
    #[serde(rename = "HOOK_ERROR")]
    Hook,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION_ERROR",
            Self::ToolNotFound => "TOOL_NOT_FOUND",
            Self::ToolOperationNotFound => "TOOL_OPERATION_NOT_FOUND",
            Self::Execution => "EXECUTION_ERROR",
            Self::Timeout => "TIMEOUT_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::Planning => "PLANNING_ERROR",
            Self::RecoveryExhausted => "RECOVERY_EXHAUSTED",
            Self::Llm => "LLM_ERROR",
            Self::Hook => "HOOK_ERROR",
        }
    }

    /// Process exit code for CLI callers.
    ///
    /// 0 success, 1 validation, 2 execution failure, 3 timeout,
    /// 4 cancellation, 5 resource exhaustion.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation | Self::ToolNotFound | Self::ToolOperationNotFound => 1,
            Self::Execution
            | Self::Planning
            | Self::RecoveryExhausted
            | Self::Llm
            | Self::Hook => 2,
            Self::Timeout => 3,
            Self::Cancelled => 4,
            Self::ResourceExhausted => 5,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One failed recovery attempt, kept when the whole chain is exhausted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryCause {
    pub strategy: String,
    pub error:    String,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("tool '{0}' not found in registry")]
    ToolNotFound(String),

    #[error("tool '{tool}' has no operation '{operation}'")]
    ToolOperationNotFound { tool: String, operation: String },

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("timed out after {0:.1}s")]
    Timeout(f64),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("resources unavailable: {0}")]
    ResourceExhausted(String),

    #[error("planning failed: {0}")]
    Planning(String),

    #[error("all recovery strategies failed ({} causes)", causes.len())]
    RecoveryExhausted { causes: Vec<RecoveryCause> },

    #[error("LLM call failed: {message}")]
    Llm { message: String, retryable: bool },

    #[error("hook '{hook}' failed: {message}")]
    Hook { hook: String, message: String },
}

impl CoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::Validation,
            Self::ToolNotFound(_) => ErrorCode::ToolNotFound,
            Self::ToolOperationNotFound { .. } => ErrorCode::ToolOperationNotFound,
            Self::Execution(_) => ErrorCode::Execution,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::Cancelled(_) => ErrorCode::Cancelled,
            Self::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
            Self::Planning(_) => ErrorCode::Planning,
            Self::RecoveryExhausted { .. } => ErrorCode::RecoveryExhausted,
            Self::Llm { .. } => ErrorCode::Llm,
            Self::Hook { .. } => ErrorCode::Hook,
        }
    }

    /// Whether a retry has any chance of succeeding.
    ///
    /// Timeouts, transient LLM failures and exhausted resource windows are
    /// retryable; validation and lookup failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::ResourceExhausted(_) => true,
            Self::Llm { retryable, .. } => *retryable,
            Self::Execution(msg) => {
                let lower = msg.to_lowercase();
                lower.contains("rate limit")
                    || lower.contains("429")
                    || lower.contains("connection")
                    || lower.contains("temporarily")
                    || lower.contains("transient")
            }
            _ => false,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
