//! Structured error taxonomy shared by every pipeline stage.
//!
//! Every variant is terminal unless noted; `ProcessingQueue` decides whether to
//! retry purely from `UnderwriterError::is_retryable`, never by matching on
//! specific variants outside this module.

use thiserror::Error;

/// The subsystem an error originated in, carried end-to-end for correlation
/// via the order's `metadata` (per spec §7 propagation policy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    Eval,
    Wallet,
    ApprovalHandler,
    Store,
    Monitor,
    Listener,
}

impl std::fmt::Display for Subsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Subsystem::Eval => "eval",
            Subsystem::Wallet => "wallet",
            Subsystem::ApprovalHandler => "approval_handler",
            Subsystem::Store => "store",
            Subsystem::Monitor => "monitor",
            Subsystem::Listener => "listener",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Error)]
pub enum UnderwriterError {
    #[error("[{subsystem}] validation failed: {reason}")]
    Validation {
        subsystem: Subsystem,
        reason: String,
    },

    #[error("[{subsystem}] order deadline exceeded")]
    DeadlineExceeded { subsystem: Subsystem },

    #[error("[{subsystem}] submission failed: {reason} (unrecoverable: {unrecoverable})")]
    Submission {
        subsystem: Subsystem,
        reason: String,
        unrecoverable: bool,
    },

    #[error("[{subsystem}] confirmation exceeded after {attempts} attempts")]
    ConfirmationExceeded { subsystem: Subsystem, attempts: u32 },

    #[error("[{subsystem}] nonce {nonce} consumed elsewhere")]
    NonceConsumedElsewhere { subsystem: Subsystem, nonce: u64 },

    #[error("[{subsystem}] upstream unavailable: {reason}")]
    Upstream {
        subsystem: Subsystem,
        reason: String,
    },

    #[error("[{subsystem}] panic in handler: {message}")]
    Panicked {
        subsystem: Subsystem,
        message: String,
    },
}

impl UnderwriterError {
    pub fn subsystem(&self) -> Subsystem {
        match self {
            UnderwriterError::Validation { subsystem, .. }
            | UnderwriterError::DeadlineExceeded { subsystem }
            | UnderwriterError::Submission { subsystem, .. }
            | UnderwriterError::ConfirmationExceeded { subsystem, .. }
            | UnderwriterError::NonceConsumedElsewhere { subsystem, .. }
            | UnderwriterError::Upstream { subsystem, .. }
            | UnderwriterError::Panicked { subsystem, .. } => *subsystem,
        }
    }

    /// Whether `handleFailedOrder` should move this to the retry bucket.
    /// Validation, deadlines, nonce conflicts and panics are always terminal;
    /// upstream errors are always retried (left in the retry bucket); submission
    /// errors retry unless flagged unrecoverable.
    pub fn is_retryable(&self) -> bool {
        match self {
            UnderwriterError::Validation { .. } => false,
            UnderwriterError::DeadlineExceeded { .. } => false,
            UnderwriterError::Submission { unrecoverable, .. } => !unrecoverable,
            UnderwriterError::ConfirmationExceeded { .. } => false,
            UnderwriterError::NonceConsumedElsewhere { .. } => false,
            UnderwriterError::Upstream { .. } => true,
            UnderwriterError::Panicked { .. } => false,
        }
    }
}
