use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::LedgerError;

pub type AccountId = String;
pub type JobId = u64;
pub type MilestoneId = u64;
pub type Amount = u64;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Created,
    Active,
    Completed,
    Cancelled,
}

impl JobStatus {
    /// Completed and cancelled jobs accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    pub client: AccountId,
    pub freelancer: Option<AccountId>,
    pub title: String,
    pub amount: Amount,
    pub status: JobStatus,
    pub milestones: Vec<MilestoneId>,
    /// Next per-job milestone id. Never decremented.
    pub(crate) next_milestone_id: MilestoneId,
}

impl Job {
    pub fn is_client(&self, account: &str) -> bool {
        self.client == account
    }

    pub fn is_freelancer(&self, account: &str) -> bool {
        self.freelancer.as_deref() == Some(account)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Milestone {
    pub id: MilestoneId,
    pub job_id: JobId,
    pub description: String,
    pub amount: Amount,
    pub completed: bool,
}

/// Accounting view over a job and its milestones.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobSummary {
    pub job_id: JobId,
    pub status: JobStatus,
    pub amount: Amount,
    pub allocated: Amount,
    pub released: Amount,
    pub unallocated: Amount,
    pub milestones_total: usize,
    pub milestones_completed: usize,
}

/// Size bounds applied to caller-supplied text.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LedgerLimits {
    pub max_title_len: usize,
    pub max_description_len: usize,
    pub max_account_len: usize,
    pub max_milestones_per_job: usize,
}

impl Default for LedgerLimits {
    fn default() -> Self {
        Self {
            max_title_len: 256,
            max_description_len: 1024,
            max_account_len: 128,
            max_milestones_per_job: 64,
        }
    }
}

impl LedgerLimits {
    pub fn check_account(&self, account: &str) -> Result<(), LedgerError> {
        if account.is_empty() {
            return Err(LedgerError::InvalidInput("account identifier is empty".into()));
        }
        if account.len() > self.max_account_len {
            return Err(LedgerError::InvalidInput(format!(
                "account identifier longer than {} bytes",
                self.max_account_len
            )));
        }
        if account
            .chars()
            .any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(LedgerError::InvalidInput(format!(
                "account identifier {account:?} contains whitespace or control characters"
            )));
        }
        Ok(())
    }

    pub fn check_title(&self, title: &str) -> Result<(), LedgerError> {
        check_text("title", title, self.max_title_len)
    }

    pub fn check_description(&self, description: &str) -> Result<(), LedgerError> {
        check_text("description", description, self.max_description_len)
    }
}

fn check_text(field: &str, value: &str, max_len: usize) -> Result<(), LedgerError> {
    if value.trim().is_empty() {
        return Err(LedgerError::InvalidInput(format!("{field} is empty")));
    }
    if value.chars().count() > max_len {
        return Err(LedgerError::InvalidInput(format!(
            "{field} longer than {max_len} characters"
        )));
    }
    Ok(())
}
