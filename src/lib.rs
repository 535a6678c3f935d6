//! Freelance escrow ledger.
//!
//! * [`ledger`]: jobs, milestones and the state machine that guards them.
//! * [`call`]: the `{success, value}` call interface over the ledger.
//! * [`host`]: exactly-once transaction sequencing and verified snapshots.
//! * [`settlement`]: fund movements implied by ledger events.
//! * [`config`] / [`logging`]: host configuration and tracing setup.

pub mod call;
pub mod config;
pub mod host;
pub mod ledger;
pub mod logging;
pub mod settlement;

pub use call::{dispatch, Call, CallResult};
pub use config::{ConfigError, HostConfig};
pub use host::{Host, HostError, Receipt, StoreError, Transaction};
pub use ledger::{
    ErrorKind, InvariantViolation, Job, JobLedger, JobStatus, LedgerError, LedgerEvent, Milestone,
};
pub use settlement::{EscrowBook, EscrowTransfer, SettlementError, SettlementPlan};
