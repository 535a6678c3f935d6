//! Job escrow ledger.
//!
//! [`JobLedger`] owns every job and milestone record and is the only way to
//! change them. Each mutating operation takes the caller identity explicitly,
//! validates completely before touching state, and appends a [`LedgerEvent`]
//! on success, so a rejected call leaves the ledger exactly as it was.

mod error;
mod events;
mod types;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub use error::{ErrorKind, InvariantViolation, LedgerError};
pub use events::LedgerEvent;
pub use types::{
    AccountId, Amount, Job, JobId, JobStatus, JobSummary, LedgerLimits, Milestone, MilestoneId,
};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobLedger {
    next_job_id: JobId,
    jobs: BTreeMap<JobId, Job>,
    milestones: BTreeMap<JobId, BTreeMap<MilestoneId, Milestone>>,
    events: Vec<LedgerEvent>,
    #[serde(skip)]
    limits: LedgerLimits,
}

impl Default for JobLedger {
    fn default() -> Self {
        Self {
            next_job_id: 1,
            jobs: BTreeMap::new(),
            milestones: BTreeMap::new(),
            events: Vec::new(),
            limits: LedgerLimits::default(),
        }
    }
}

impl JobLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: LedgerLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    pub fn limits(&self) -> &LedgerLimits {
        &self.limits
    }

    /// Limits are not persisted; the host reapplies them after loading.
    pub fn set_limits(&mut self, limits: LedgerLimits) {
        self.limits = limits;
    }

    pub fn next_job_id(&self) -> JobId {
        self.next_job_id
    }

    pub fn create_job(
        &mut self,
        client: &str,
        freelancer: Option<&str>,
        title: &str,
        amount: Amount,
    ) -> Result<JobId, LedgerError> {
        self.limits.check_account(client)?;
        if let Some(freelancer) = freelancer {
            self.limits.check_account(freelancer)?;
            if freelancer == client {
                return Err(LedgerError::SameParty {
                    account: client.to_string(),
                });
            }
        }
        self.limits.check_title(title)?;

        let job_id = self.next_job_id;
        let next = job_id
            .checked_add(1)
            .ok_or_else(|| LedgerError::InvalidInput("job id space exhausted".into()))?;

        let job = Job {
            id: job_id,
            client: client.to_string(),
            freelancer: freelancer.map(str::to_string),
            title: title.to_string(),
            amount,
            status: JobStatus::Created,
            milestones: Vec::new(),
            next_milestone_id: 1,
        };
        self.next_job_id = next;
        self.jobs.insert(job_id, job);
        self.milestones.insert(job_id, BTreeMap::new());
        self.events.push(LedgerEvent::JobCreated {
            job_id,
            client: client.to_string(),
            freelancer: freelancer.map(str::to_string),
            amount,
        });
        debug!(job_id, client, amount, "job created");
        Ok(job_id)
    }

    pub fn assign_freelancer(
        &mut self,
        caller: &str,
        job_id: JobId,
        freelancer: &str,
    ) -> Result<(), LedgerError> {
        let job = self.get_job(job_id)?;
        require_client(job, caller, "assign a freelancer to")?;
        require_status(job, JobStatus::Created, "freelancer is fixed once work starts")?;
        self.limits.check_account(freelancer)?;
        if job.is_client(freelancer) {
            return Err(LedgerError::SameParty {
                account: freelancer.to_string(),
            });
        }

        let job = self.job_mut(job_id)?;
        job.freelancer = Some(freelancer.to_string());
        self.events.push(LedgerEvent::FreelancerAssigned {
            job_id,
            freelancer: freelancer.to_string(),
        });
        debug!(job_id, freelancer, "freelancer assigned");
        Ok(())
    }

    pub fn add_milestone(
        &mut self,
        caller: &str,
        job_id: JobId,
        description: &str,
        amount: Amount,
    ) -> Result<MilestoneId, LedgerError> {
        let job = self.get_job(job_id)?;
        require_client(job, caller, "add milestones to")?;
        require_status(job, JobStatus::Created, "milestones are fixed once work starts")?;
        self.limits.check_description(description)?;
        if job.milestones.len() >= self.limits.max_milestones_per_job {
            return Err(LedgerError::InvalidInput(format!(
                "job {job_id} already has {} milestones",
                job.milestones.len()
            )));
        }
        let requested = u128::from(self.allocated(job_id)) + u128::from(amount);
        if requested > u128::from(job.amount) {
            return Err(LedgerError::BudgetExceeded {
                job_id,
                budget: job.amount,
                requested,
            });
        }

        let job = self.job_mut(job_id)?;
        let milestone_id = job.next_milestone_id;
        job.next_milestone_id += 1;
        job.milestones.push(milestone_id);
        self.milestones.entry(job_id).or_default().insert(
            milestone_id,
            Milestone {
                id: milestone_id,
                job_id,
                description: description.to_string(),
                amount,
                completed: false,
            },
        );
        self.events.push(LedgerEvent::MilestoneAdded {
            job_id,
            milestone_id,
            amount,
        });
        debug!(job_id, milestone_id, amount, "milestone added");
        Ok(milestone_id)
    }

    pub fn start_job(&mut self, caller: &str, job_id: JobId) -> Result<(), LedgerError> {
        let job = self.get_job(job_id)?;
        require_client(job, caller, "start")?;
        require_status(job, JobStatus::Created, "only created jobs can start")?;
        let Some(freelancer) = job.freelancer.clone() else {
            return Err(invalid_state(job, "no freelancer assigned"));
        };
        if job.milestones.is_empty() {
            return Err(invalid_state(job, "job has no milestones"));
        }

        let job = self.job_mut(job_id)?;
        job.status = JobStatus::Active;
        let event = LedgerEvent::JobStarted {
            job_id,
            client: job.client.clone(),
            freelancer,
            amount: job.amount,
        };
        self.events.push(event);
        debug!(job_id, "job started");
        Ok(())
    }

    /// Marks a milestone done and returns the resulting job status, which is
    /// `Completed` when this was the last open milestone.
    pub fn complete_milestone(
        &mut self,
        caller: &str,
        job_id: JobId,
        milestone_id: MilestoneId,
    ) -> Result<JobStatus, LedgerError> {
        let job = self.get_job(job_id)?;
        if !job.is_freelancer(caller) {
            return Err(unauthorized(job, caller, "complete milestones of"));
        }
        let milestone = self.get_milestone(job_id, milestone_id)?;
        require_status(
            job,
            JobStatus::Active,
            "milestones complete only while the job is active",
        )?;
        if milestone.completed {
            return Err(invalid_state(job, "milestone already completed"));
        }

        let freelancer = caller.to_string();
        let amount = milestone.amount;
        if let Some(milestone) = self
            .milestones
            .get_mut(&job_id)
            .and_then(|m| m.get_mut(&milestone_id))
        {
            milestone.completed = true;
        }
        self.events.push(LedgerEvent::MilestoneCompleted {
            job_id,
            milestone_id,
            freelancer,
            amount,
        });
        debug!(job_id, milestone_id, amount, "milestone completed");

        let all_done = self
            .milestones
            .get(&job_id)
            .map_or(false, |m| m.values().all(|m| m.completed));
        if !all_done {
            return Ok(JobStatus::Active);
        }

        let unallocated = self.unallocated(job_id)?;
        let job = self.job_mut(job_id)?;
        job.status = JobStatus::Completed;
        let client = job.client.clone();
        self.events.push(LedgerEvent::JobCompleted {
            job_id,
            client,
            unallocated,
        });
        info!(job_id, unallocated, "job completed");
        Ok(JobStatus::Completed)
    }

    pub fn cancel_job(&mut self, caller: &str, job_id: JobId) -> Result<(), LedgerError> {
        let job = self.get_job(job_id)?;
        require_client(job, caller, "cancel")?;
        if job.status.is_terminal() {
            return Err(invalid_state(job, "job already finished"));
        }
        // Nothing is held until the job starts.
        let refundable = match job.status {
            JobStatus::Active => job.amount.saturating_sub(self.released(job_id)),
            _ => 0,
        };

        let job = self.job_mut(job_id)?;
        job.status = JobStatus::Cancelled;
        let client = job.client.clone();
        self.events.push(LedgerEvent::JobCancelled {
            job_id,
            client,
            refundable,
        });
        info!(job_id, refundable, "job cancelled");
        Ok(())
    }

    pub fn get_job(&self, job_id: JobId) -> Result<&Job, LedgerError> {
        self.jobs
            .get(&job_id)
            .ok_or(LedgerError::JobNotFound { job_id })
    }

    pub fn get_milestone(
        &self,
        job_id: JobId,
        milestone_id: MilestoneId,
    ) -> Result<&Milestone, LedgerError> {
        self.get_job(job_id)?;
        self.milestones
            .get(&job_id)
            .and_then(|m| m.get(&milestone_id))
            .ok_or(LedgerError::MilestoneNotFound {
                job_id,
                milestone_id,
            })
    }

    /// Milestones of a job in creation order.
    pub fn milestones(&self, job_id: JobId) -> Result<Vec<&Milestone>, LedgerError> {
        let job = self.get_job(job_id)?;
        job.milestones
            .iter()
            .map(|id| self.get_milestone(job_id, *id))
            .collect()
    }

    /// Jobs where the account is either client or freelancer.
    pub fn jobs_for(&self, account: &str) -> Vec<&Job> {
        self.jobs
            .values()
            .filter(|job| job.is_client(account) || job.is_freelancer(account))
            .collect()
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn events(&self) -> &[LedgerEvent] {
        &self.events
    }

    pub fn summary(&self, job_id: JobId) -> Result<JobSummary, LedgerError> {
        let job = self.get_job(job_id)?;
        let milestones = self.milestones(job_id)?;
        Ok(JobSummary {
            job_id,
            status: job.status,
            amount: job.amount,
            allocated: self.allocated(job_id),
            released: self.released(job_id),
            unallocated: self.unallocated(job_id)?,
            milestones_total: milestones.len(),
            milestones_completed: milestones.iter().filter(|m| m.completed).count(),
        })
    }

    fn job_mut(&mut self, job_id: JobId) -> Result<&mut Job, LedgerError> {
        self.jobs
            .get_mut(&job_id)
            .ok_or(LedgerError::JobNotFound { job_id })
    }

    // Milestone sums never exceed the job amount, so these fit in Amount.
    fn allocated(&self, job_id: JobId) -> Amount {
        self.milestones
            .get(&job_id)
            .map_or(0, |m| m.values().map(|m| m.amount).sum())
    }

    fn released(&self, job_id: JobId) -> Amount {
        self.milestones.get(&job_id).map_or(0, |m| {
            m.values().filter(|m| m.completed).map(|m| m.amount).sum()
        })
    }

    fn unallocated(&self, job_id: JobId) -> Result<Amount, LedgerError> {
        let job = self.get_job(job_id)?;
        Ok(job.amount.saturating_sub(self.allocated(job_id)))
    }

    pub(crate) fn milestone_tables(&self) -> &BTreeMap<JobId, BTreeMap<MilestoneId, Milestone>> {
        &self.milestones
    }

    /// Checks a ledger that came from storage rather than from its own
    /// operations: job and milestone records agree with each other and with
    /// their counters, budgets hold, statuses match milestone progress, and
    /// the event log describes exactly the current records.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if self.next_job_id == 0 {
            return Err(violation(0, "job counter starts at 1"));
        }
        if let Some(&orphan) = self.milestones.keys().find(|id| !self.jobs.contains_key(*id)) {
            return Err(violation(orphan, "milestones recorded for an unknown job"));
        }
        for (&job_id, job) in &self.jobs {
            self.check_job(job_id, job)?;
        }
        self.check_events()
    }

    fn check_job(&self, job_id: JobId, job: &Job) -> Result<(), InvariantViolation> {
        if job.id != job_id {
            return Err(violation(job_id, "job stored under another id"));
        }
        if job_id == 0 || job_id >= self.next_job_id {
            return Err(violation(job_id, "job id is not below the job counter"));
        }
        if job.freelancer.as_deref() == Some(job.client.as_str()) {
            return Err(violation(job_id, "client and freelancer are the same account"));
        }
        let Some(table) = self.milestones.get(&job_id) else {
            return Err(violation(job_id, "job has no milestone table"));
        };
        if !job.milestones.iter().eq(table.keys()) {
            return Err(violation(job_id, "milestone list disagrees with milestone records"));
        }
        if job.milestones.first() == Some(&0) {
            return Err(violation(job_id, "milestone ids start at 1"));
        }
        if job.milestones.last().map_or(false, |&id| id >= job.next_milestone_id) {
            return Err(violation(job_id, "milestone id is not below the milestone counter"));
        }
        if table
            .iter()
            .any(|(&id, milestone)| milestone.id != id || milestone.job_id != job_id)
        {
            return Err(violation(job_id, "milestone stored under another id"));
        }
        let allocated: u128 = table.values().map(|m| u128::from(m.amount)).sum();
        if allocated > u128::from(job.amount) {
            return Err(violation(job_id, "milestones exceed the job amount"));
        }

        let total = table.len();
        let done = table.values().filter(|m| m.completed).count();
        let assigned = job.freelancer.is_some();
        let consistent = match job.status {
            JobStatus::Created => done == 0,
            JobStatus::Active => assigned && total > 0 && done < total,
            JobStatus::Completed => assigned && total > 0 && done == total,
            // Completed milestones mean the job was active when cancelled.
            JobStatus::Cancelled => done == 0 || (assigned && done < total),
        };
        if !consistent {
            return Err(violation(job_id, "status disagrees with milestone progress"));
        }
        Ok(())
    }

    fn milestone_record(&self, job_id: JobId, milestone_id: MilestoneId) -> Option<&Milestone> {
        self.milestones.get(&job_id)?.get(&milestone_id)
    }

    fn check_events(&self) -> Result<(), InvariantViolation> {
        let mut created = BTreeSet::new();
        let mut started = BTreeSet::new();
        let mut finished = BTreeSet::new();
        let mut added = BTreeSet::new();
        let mut paid = BTreeSet::new();

        for event in &self.events {
            let job_id = event.job_id();
            let Some(job) = self.jobs.get(&job_id) else {
                return Err(violation(job_id, "event for an unknown job"));
            };
            let open = created.contains(&job_id) && !finished.contains(&job_id);
            let agrees = match event {
                LedgerEvent::JobCreated { client, amount, .. } => {
                    *client == job.client && *amount == job.amount && created.insert(job_id)
                }
                LedgerEvent::FreelancerAssigned { .. } => open && !started.contains(&job_id),
                LedgerEvent::MilestoneAdded {
                    milestone_id,
                    amount,
                    ..
                } => {
                    open && !started.contains(&job_id)
                        && self
                            .milestone_record(job_id, *milestone_id)
                            .map_or(false, |m| m.amount == *amount)
                        && added.insert((job_id, *milestone_id))
                }
                LedgerEvent::JobStarted {
                    client,
                    freelancer,
                    amount,
                    ..
                } => {
                    open && job.status != JobStatus::Created
                        && *client == job.client
                        && job.is_freelancer(freelancer)
                        && *amount == job.amount
                        && started.insert(job_id)
                }
                LedgerEvent::MilestoneCompleted {
                    milestone_id,
                    freelancer,
                    amount,
                    ..
                } => {
                    open && started.contains(&job_id)
                        && job.is_freelancer(freelancer)
                        && self
                            .milestone_record(job_id, *milestone_id)
                            .map_or(false, |m| m.completed && m.amount == *amount)
                        && paid.insert((job_id, *milestone_id))
                }
                LedgerEvent::JobCompleted {
                    client,
                    unallocated,
                    ..
                } => {
                    open && started.contains(&job_id)
                        && job.status == JobStatus::Completed
                        && *client == job.client
                        && *unallocated == job.amount.saturating_sub(self.allocated(job_id))
                        && finished.insert(job_id)
                }
                LedgerEvent::JobCancelled {
                    client, refundable, ..
                } => {
                    let expected = if started.contains(&job_id) {
                        job.amount.saturating_sub(self.released(job_id))
                    } else {
                        0
                    };
                    open && job.status == JobStatus::Cancelled
                        && *client == job.client
                        && *refundable == expected
                        && finished.insert(job_id)
                }
            };
            if !agrees {
                return Err(violation(job_id, "event disagrees with the job records"));
            }
        }

        for (&job_id, job) in &self.jobs {
            let began = matches!(job.status, JobStatus::Active | JobStatus::Completed);
            let logged = created.contains(&job_id)
                && (!began || started.contains(&job_id))
                && job.status.is_terminal() == finished.contains(&job_id)
                && self.milestones.get(&job_id).map_or(true, |table| {
                    table.values().all(|m| {
                        let key = (job_id, m.id);
                        added.contains(&key) && m.completed == paid.contains(&key)
                    })
                });
            if !logged {
                return Err(violation(job_id, "event log is missing changes to the job"));
            }
        }
        Ok(())
    }
}

fn violation(job_id: JobId, reason: &'static str) -> InvariantViolation {
    InvariantViolation { job_id, reason }
}

fn require_client(job: &Job, caller: &str, action: &'static str) -> Result<(), LedgerError> {
    if job.is_client(caller) {
        Ok(())
    } else {
        Err(unauthorized(job, caller, action))
    }
}

fn require_status(
    job: &Job,
    expected: JobStatus,
    reason: &'static str,
) -> Result<(), LedgerError> {
    if job.status == expected {
        Ok(())
    } else {
        Err(invalid_state(job, reason))
    }
}

fn unauthorized(job: &Job, caller: &str, action: &'static str) -> LedgerError {
    LedgerError::Unauthorized {
        job_id: job.id,
        caller: caller.to_string(),
        action,
    }
}

fn invalid_state(job: &Job, reason: &'static str) -> LedgerError {
    LedgerError::InvalidState {
        job_id: job.id,
        status: job.status,
        reason,
    }
}
