use std::fmt;

use serde::{Deserialize, Serialize};

use super::types::{AccountId, Amount, JobId, JobStatus, MilestoneId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("client and freelancer must be different accounts ({account})")]
    SameParty { account: AccountId },
    #[error("unknown job {job_id}")]
    JobNotFound { job_id: JobId },
    #[error("unknown milestone {milestone_id} on job {job_id}")]
    MilestoneNotFound {
        job_id: JobId,
        milestone_id: MilestoneId,
    },
    #[error("{caller} is not allowed to {action} job {job_id}")]
    Unauthorized {
        job_id: JobId,
        caller: AccountId,
        action: &'static str,
    },
    #[error("job {job_id} is {status}: {reason}")]
    InvalidState {
        job_id: JobId,
        status: JobStatus,
        reason: &'static str,
    },
    #[error("job {job_id} budget is {budget}, milestones would total {requested}")]
    BudgetExceeded {
        job_id: JobId,
        budget: Amount,
        requested: u128,
    },
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::InvalidInput(_) => ErrorKind::InvalidInput,
            LedgerError::SameParty { .. } => ErrorKind::SameParty,
            LedgerError::JobNotFound { .. } | LedgerError::MilestoneNotFound { .. } => {
                ErrorKind::NotFound
            }
            LedgerError::Unauthorized { .. } => ErrorKind::Unauthorized,
            LedgerError::InvalidState { .. } => ErrorKind::InvalidState,
            LedgerError::BudgetExceeded { .. } => ErrorKind::BudgetExceeded,
        }
    }
}

/// Flat error discriminant exposed on the call interface.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidInput,
    SameParty,
    NotFound,
    Unauthorized,
    InvalidState,
    BudgetExceeded,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidInput => "InvalidInput",
            ErrorKind::SameParty => "SameParty",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Unauthorized => "Unauthorized",
            ErrorKind::InvalidState => "InvalidState",
            ErrorKind::BudgetExceeded => "BudgetExceeded",
        };
        f.write_str(name)
    }
}

/// Stored records that contradict each other, found when checking a ledger
/// that was loaded rather than built through its operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("inconsistent ledger at job {job_id}: {reason}")]
pub struct InvariantViolation {
    pub job_id: JobId,
    pub reason: &'static str,
}
