use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ledger::{AccountId, Amount, JobId, LedgerEvent};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SettlementError {
    #[error("job {job_id} holds {held}, cannot pay out {amount}")]
    Overdraw {
        job_id: JobId,
        held: Amount,
        amount: Amount,
    },
    #[error("job {job_id} is already locked")]
    AlreadyLocked { job_id: JobId },
}

/// A single fund movement the transfer facility has to perform.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EscrowTransfer {
    Lock {
        job_id: JobId,
        from: AccountId,
        amount: Amount,
        memo: String,
    },
    Release {
        job_id: JobId,
        to: AccountId,
        amount: Amount,
        memo: String,
    },
    Refund {
        job_id: JobId,
        to: AccountId,
        amount: Amount,
        memo: String,
    },
}

impl EscrowTransfer {
    pub fn job_id(&self) -> JobId {
        match self {
            EscrowTransfer::Lock { job_id, .. }
            | EscrowTransfer::Release { job_id, .. }
            | EscrowTransfer::Refund { job_id, .. } => *job_id,
        }
    }

    pub fn amount(&self) -> Amount {
        match self {
            EscrowTransfer::Lock { amount, .. }
            | EscrowTransfer::Release { amount, .. }
            | EscrowTransfer::Refund { amount, .. } => *amount,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SettlementPlan {
    pub transfers: Vec<EscrowTransfer>,
}

impl SettlementPlan {
    /// Plans transfers for a stream of ledger events, in event order.
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a LedgerEvent>) -> Self {
        let transfers = events.into_iter().filter_map(transfer_for).collect();
        Self { transfers }
    }

    pub fn for_job(events: &[LedgerEvent], job_id: JobId) -> Self {
        Self::from_events(events.iter().filter(|e| e.job_id() == job_id))
    }

    pub fn total_locked(&self) -> Amount {
        self.sum(|t| matches!(t, EscrowTransfer::Lock { .. }))
    }

    pub fn total_released(&self) -> Amount {
        self.sum(|t| matches!(t, EscrowTransfer::Release { .. }))
    }

    pub fn total_refunded(&self) -> Amount {
        self.sum(|t| matches!(t, EscrowTransfer::Refund { .. }))
    }

    fn sum(&self, pick: impl Fn(&EscrowTransfer) -> bool) -> Amount {
        self.transfers
            .iter()
            .filter(|t| pick(t))
            .map(EscrowTransfer::amount)
            .sum()
    }
}

fn transfer_for(event: &LedgerEvent) -> Option<EscrowTransfer> {
    match event {
        LedgerEvent::JobStarted {
            job_id,
            client,
            amount,
            ..
        } => Some(EscrowTransfer::Lock {
            job_id: *job_id,
            from: client.clone(),
            amount: *amount,
            memo: format!("job:{job_id} escrow"),
        }),
        LedgerEvent::MilestoneCompleted {
            job_id,
            milestone_id,
            freelancer,
            amount,
        } => Some(EscrowTransfer::Release {
            job_id: *job_id,
            to: freelancer.clone(),
            amount: *amount,
            memo: format!("job:{job_id} milestone:{milestone_id} payout"),
        }),
        LedgerEvent::JobCompleted {
            job_id,
            client,
            unallocated,
        } if *unallocated > 0 => Some(EscrowTransfer::Refund {
            job_id: *job_id,
            to: client.clone(),
            amount: *unallocated,
            memo: format!("job:{job_id} unallocated remainder"),
        }),
        LedgerEvent::JobCancelled {
            job_id,
            client,
            refundable,
        } if *refundable > 0 => Some(EscrowTransfer::Refund {
            job_id: *job_id,
            to: client.clone(),
            amount: *refundable,
            memo: format!("job:{job_id} cancelled"),
        }),
        _ => None,
    }
}

/// Running escrow balances: value held per job and value paid per account.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct EscrowBook {
    pub held: BTreeMap<JobId, Amount>,
    pub paid: BTreeMap<AccountId, Amount>,
    pub deposited: BTreeMap<AccountId, Amount>,
}

impl EscrowBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a whole plan; on error the book is left unchanged.
    pub fn apply(&mut self, plan: &SettlementPlan) -> Result<(), SettlementError> {
        let mut next = self.clone();
        for transfer in &plan.transfers {
            next.apply_transfer(transfer)?;
        }
        *self = next;
        Ok(())
    }

    fn apply_transfer(&mut self, transfer: &EscrowTransfer) -> Result<(), SettlementError> {
        match transfer {
            EscrowTransfer::Lock {
                job_id,
                from,
                amount,
                ..
            } => {
                if self.held.contains_key(job_id) {
                    return Err(SettlementError::AlreadyLocked { job_id: *job_id });
                }
                self.held.insert(*job_id, *amount);
                *self.deposited.entry(from.clone()).or_default() += amount;
            }
            EscrowTransfer::Release {
                job_id, to, amount, ..
            }
            | EscrowTransfer::Refund {
                job_id, to, amount, ..
            } => {
                let held = self.held.get(job_id).copied().unwrap_or(0);
                if held < *amount {
                    return Err(SettlementError::Overdraw {
                        job_id: *job_id,
                        held,
                        amount: *amount,
                    });
                }
                self.held.insert(*job_id, held - amount);
                *self.paid.entry(to.clone()).or_default() += amount;
            }
        }
        Ok(())
    }

    pub fn held_for(&self, job_id: JobId) -> Amount {
        self.held.get(&job_id).copied().unwrap_or(0)
    }

    pub fn paid_to(&self, account: &str) -> Amount {
        self.paid.get(account).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::JobLedger;

    const CLIENT: &str = "client";
    const FREELANCER: &str = "freelancer";

    fn funded_job(ledger: &mut JobLedger, amount: Amount, milestones: &[Amount]) -> JobId {
        let job_id = ledger
            .create_job(CLIENT, Some(FREELANCER), "Build Website", amount)
            .unwrap();
        for (idx, m) in milestones.iter().enumerate() {
            ledger
                .add_milestone(CLIENT, job_id, &format!("phase {idx}"), *m)
                .unwrap();
        }
        ledger.start_job(CLIENT, job_id).unwrap();
        job_id
    }

    #[test]
    fn completed_job_releases_milestones_and_refunds_remainder() {
        let mut ledger = JobLedger::new();
        let job_id = funded_job(&mut ledger, 5000, &[1000, 3000]);
        ledger.complete_milestone(FREELANCER, job_id, 1).unwrap();
        ledger.complete_milestone(FREELANCER, job_id, 2).unwrap();

        let plan = SettlementPlan::for_job(ledger.events(), job_id);
        assert_eq!(plan.transfers.len(), 4);
        assert_eq!(plan.total_locked(), 5000);
        assert_eq!(plan.total_released(), 4000);
        assert_eq!(plan.total_refunded(), 1000);
        match &plan.transfers[1] {
            EscrowTransfer::Release { to, amount, memo, .. } => {
                assert_eq!(to, FREELANCER);
                assert_eq!(*amount, 1000);
                assert_eq!(memo, "job:1 milestone:1 payout");
            }
            other => panic!("expected release, got {other:?}"),
        }

        let mut book = EscrowBook::new();
        book.apply(&plan).unwrap();
        assert_eq!(book.held_for(job_id), 0);
        assert_eq!(book.paid_to(FREELANCER), 4000);
        assert_eq!(book.paid_to(CLIENT), 1000);
    }

    #[test]
    fn cancelled_job_refunds_what_was_not_released() {
        let mut ledger = JobLedger::new();
        let job_id = funded_job(&mut ledger, 3000, &[1000, 2000]);
        ledger.complete_milestone(FREELANCER, job_id, 1).unwrap();
        ledger.cancel_job(CLIENT, job_id).unwrap();

        let plan = SettlementPlan::from_events(ledger.events());
        assert_eq!(
            plan.total_locked(),
            plan.total_released() + plan.total_refunded()
        );
        let mut book = EscrowBook::new();
        book.apply(&plan).unwrap();
        assert_eq!(book.paid_to(CLIENT), 2000);
        assert_eq!(book.held_for(job_id), 0);
    }

    #[test]
    fn jobs_cancelled_before_start_move_nothing() {
        let mut ledger = JobLedger::new();
        let job_id = ledger
            .create_job(CLIENT, Some(FREELANCER), "Logo", 700)
            .unwrap();
        ledger.cancel_job(CLIENT, job_id).unwrap();
        assert!(SettlementPlan::for_job(ledger.events(), job_id)
            .transfers
            .is_empty());
    }

    #[test]
    fn overdraw_leaves_book_untouched() {
        let mut book = EscrowBook::new();
        let plan = SettlementPlan {
            transfers: vec![
                EscrowTransfer::Lock {
                    job_id: 1,
                    from: CLIENT.into(),
                    amount: 100,
                    memo: String::new(),
                },
                EscrowTransfer::Release {
                    job_id: 1,
                    to: FREELANCER.into(),
                    amount: 150,
                    memo: String::new(),
                },
            ],
        };
        let err = book.apply(&plan).unwrap_err();
        assert_eq!(
            err,
            SettlementError::Overdraw {
                job_id: 1,
                held: 100,
                amount: 150
            }
        );
        assert_eq!(book, EscrowBook::new());
    }
}
