//! Error types for the execution engine and protocol connectors

use crate::operation::Protocol;

use ethers::types::H256;
use std::fmt;
use thiserror::Error;

/// Recognizable reason families a revert payload can decode into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RevertCategory {
    SlippageExceeded,
    DeadlineExpired,
    ReceiptMismatch,
    InsufficientAllowance,
    InsufficientBalance,
    WithdrawalNotReady,
    Other,
}

impl RevertCategory {
    pub fn name(&self) -> &'static str {
        match self {
            RevertCategory::SlippageExceeded => "slippage_exceeded",
            RevertCategory::DeadlineExpired => "deadline_expired",
            RevertCategory::ReceiptMismatch => "receipt_mismatch",
            RevertCategory::InsufficientAllowance => "insufficient_allowance",
            RevertCategory::InsufficientBalance => "insufficient_balance",
            RevertCategory::WithdrawalNotReady => "withdrawal_not_ready",
            RevertCategory::Other => "other",
        }
    }
}

/// Decoded revert reason; `message` is `None` when the payload was opaque
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevertReason {
    pub message: Option<String>,
    pub category: RevertCategory,
}

impl RevertReason {
    pub fn new(message: impl Into<String>, category: RevertCategory) -> Self {
        Self {
            message: Some(message.into()),
            category,
        }
    }

    /// Generic on-chain rejection with nothing decodable
    pub fn opaque() -> Self {
        Self {
            message: None,
            category: RevertCategory::Other,
        }
    }
}

impl fmt::Display for RevertReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}", message),
            None => write!(f, "rejected on-chain without a reason"),
        }
    }
}

/// Stable failure taxonomy produced by the classifier
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("transient failure: {cause}")]
    Transient { cause: String },

    #[error("nonce conflict: {cause}")]
    NonceConflict { cause: String },

    #[error("reverted: {reason}")]
    Revert { reason: RevertReason, cause: String },

    #[error("configuration error: {cause}")]
    Configuration { cause: String },

    #[error("outcome unknown: {cause}")]
    Timeout { cause: String },

    #[error("submission failed after {attempts} attempts: {last}")]
    SubmissionFailed { attempts: u32, last: Box<ErrorKind> },
}

impl ErrorKind {
    pub fn transient(cause: impl Into<String>) -> Self {
        ErrorKind::Transient {
            cause: cause.into(),
        }
    }

    pub fn configuration(cause: impl Into<String>) -> Self {
        ErrorKind::Configuration {
            cause: cause.into(),
        }
    }

    pub fn timeout(cause: impl Into<String>) -> Self {
        ErrorKind::Timeout {
            cause: cause.into(),
        }
    }

    pub fn revert(reason: RevertReason, cause: impl Into<String>) -> Self {
        ErrorKind::Revert {
            reason,
            cause: cause.into(),
        }
    }

    /// Check if the failure is safe to retry with the same signed payload
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient { .. })
    }

    /// Revert reason, if this is a revert
    pub fn revert_reason(&self) -> Option<&RevertReason> {
        match self {
            ErrorKind::Revert { reason, .. } => Some(reason),
            _ => None,
        }
    }

    /// Label used in metrics and logs
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::Transient { .. } => "transient",
            ErrorKind::NonceConflict { .. } => "nonce_conflict",
            ErrorKind::Revert { .. } => "revert",
            ErrorKind::Configuration { .. } => "configuration",
            ErrorKind::Timeout { .. } => "timeout",
            ErrorKind::SubmissionFailed { .. } => "submission_failed",
        }
    }
}

/// Error surfaced to callers, attributed to the protocol and operation it came from
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{protocol} {operation} failed: {kind}")]
pub struct AgentError {
    pub protocol: Protocol,
    pub operation: &'static str,
    pub kind: ErrorKind,
    /// Nonce consumed on the network, if the transaction was accepted
    pub nonce: Option<u64>,
    pub tx_hash: Option<H256>,
}

impl AgentError {
    pub fn new(protocol: Protocol, operation: &'static str, kind: ErrorKind) -> Self {
        Self {
            protocol,
            operation,
            kind,
            nonce: None,
            tx_hash: None,
        }
    }

    pub fn configuration(
        protocol: Protocol,
        operation: &'static str,
        cause: impl Into<String>,
    ) -> Self {
        Self::new(protocol, operation, ErrorKind::configuration(cause))
    }

    /// Attach the accepted transaction this failure belongs to
    pub fn with_submission(mut self, nonce: u64, tx_hash: H256) -> Self {
        self.nonce = Some(nonce);
        self.tx_hash = Some(tx_hash);
        self
    }

    /// Whether gas was paid, i.e. the network accepted a transaction
    pub fn fees_spent(&self) -> bool {
        self.tx_hash.is_some()
    }
}

/// Result type for connector and engine operations
pub type AgentResult<T> = Result<T, AgentError>;
