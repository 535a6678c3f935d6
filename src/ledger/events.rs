use serde::{Deserialize, Serialize};

use super::types::{AccountId, Amount, JobId, MilestoneId};

/// Observable record of a successful ledger mutation, in application order.
///
/// Events carry every figure a fund-transfer facility needs, so settlement
/// can be planned from the event stream alone.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    JobCreated {
        job_id: JobId,
        client: AccountId,
        freelancer: Option<AccountId>,
        amount: Amount,
    },
    FreelancerAssigned {
        job_id: JobId,
        freelancer: AccountId,
    },
    MilestoneAdded {
        job_id: JobId,
        milestone_id: MilestoneId,
        amount: Amount,
    },
    JobStarted {
        job_id: JobId,
        client: AccountId,
        freelancer: AccountId,
        amount: Amount,
    },
    MilestoneCompleted {
        job_id: JobId,
        milestone_id: MilestoneId,
        freelancer: AccountId,
        amount: Amount,
    },
    JobCompleted {
        job_id: JobId,
        client: AccountId,
        unallocated: Amount,
    },
    JobCancelled {
        job_id: JobId,
        client: AccountId,
        refundable: Amount,
    },
}

impl LedgerEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            LedgerEvent::JobCreated { job_id, .. }
            | LedgerEvent::FreelancerAssigned { job_id, .. }
            | LedgerEvent::MilestoneAdded { job_id, .. }
            | LedgerEvent::JobStarted { job_id, .. }
            | LedgerEvent::MilestoneCompleted { job_id, .. }
            | LedgerEvent::JobCompleted { job_id, .. }
            | LedgerEvent::JobCancelled { job_id, .. } => *job_id,
        }
    }
}
