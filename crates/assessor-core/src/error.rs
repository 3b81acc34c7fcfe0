//! Error kinds surfaced by the dispatch flow

use assessor_knowledge::{LedgerError, MemoryStoreError, ReferenceKind};

/// External call being made when a failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Session,
    Memory,
    Router,
    Manager,
    Retrieval,
    Knowledge,
    Evaluator,
    Curator,
    Fusion,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Session => "session",
            Self::Memory => "memory",
            Self::Router => "router",
            Self::Manager => "manager",
            Self::Retrieval => "retrieval",
            Self::Knowledge => "knowledge",
            Self::Evaluator => "evaluator",
            Self::Curator => "curator",
            Self::Fusion => "fusion",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AssessorError {
    /// Missing or wrong bearer token
    #[error("authentication failed")]
    AuthFailure,

    /// The requester's email does not resolve to an employee
    #[error("no session for '{0}'")]
    SessionNotFound(String),

    /// Credentials or settings for the generative backend are unusable
    #[error("backend initialization failed: {0}")]
    BackendInitFailure(String),

    #[error("memory store unavailable: {0}")]
    MemoryStoreUnavailable(String),

    #[error("{kind} '{value}' not found")]
    LedgerReferenceNotFound { kind: ReferenceKind, value: String },

    /// Classification call to the router failed
    #[error("router unavailable: {0}")]
    RouterUnavailable(String),

    #[error("{stage} call timed out after {secs}s")]
    Timeout { stage: Stage, secs: u64 },

    /// Router emitted a route line that does not parse
    #[error("invalid route: {0}")]
    InvalidRoute(String),

    /// Request rejected before any generation work
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    GenericDispatchFailure(String),
}

impl AssessorError {
    /// Failures the caller caused, as opposed to failures inside the flow
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::AuthFailure | Self::SessionNotFound(_) | Self::BackendInitFailure(_) | Self::InvalidInput(_)
        )
    }

    pub(crate) fn at_stage(stage: Stage, e: impl std::fmt::Display) -> Self {
        Self::GenericDispatchFailure(format!("{} failed: {}", stage, e))
    }
}

impl From<MemoryStoreError> for AssessorError {
    fn from(e: MemoryStoreError) -> Self {
        match e {
            MemoryStoreError::Unavailable(msg) => Self::MemoryStoreUnavailable(msg),
        }
    }
}

impl From<LedgerError> for AssessorError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::ReferenceNotFound { kind, value } => Self::LedgerReferenceNotFound { kind, value },
            other => Self::GenericDispatchFailure(other.to_string()),
        }
    }
}

pub type AssessorResult<T> = std::result::Result<T, AssessorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_names_stage() {
        let err = AssessorError::Timeout {
            stage: Stage::Curator,
            secs: 30,
        };
        assert_eq!(err.to_string(), "curator call timed out after 30s");
    }

    #[test]
    fn test_ledger_reference_maps_to_typed_kind() {
        let err: AssessorError = LedgerError::ReferenceNotFound {
            kind: ReferenceKind::Employee,
            value: "unknown@x.com".to_string(),
        }
        .into();
        assert!(matches!(
            err,
            AssessorError::LedgerReferenceNotFound { kind: ReferenceKind::Employee, .. }
        ));
        assert_eq!(err.to_string(), "employee 'unknown@x.com' not found");
    }

    #[test]
    fn test_client_errors() {
        assert!(AssessorError::AuthFailure.is_client_error());
        assert!(AssessorError::SessionNotFound("a@b.c".into()).is_client_error());
        assert!(!AssessorError::RouterUnavailable("down".into()).is_client_error());
        assert!(!AssessorError::InvalidRoute("x".into()).is_client_error());
    }
}
