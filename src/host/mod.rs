//! Host-side transaction sequencing.
//!
//! [`Host`] stands in for the ledger environment around [`JobLedger`]: it
//! applies each transaction exactly once, keeps the block height, and
//! persists verified snapshots.

mod snapshot;

use std::collections::BTreeSet;
use std::io::BufRead;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::call::{self, Call, CallResult};
use crate::ledger::{AccountId, JobLedger, LedgerLimits};

pub use snapshot::{compute_state_root, Digest32, LedgerSnapshot, SnapshotMetadata, StoreError};

pub type TxId = Digest32;

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("transaction {0} was already applied")]
    DuplicateTransaction(TxId),
    #[error("invalid transaction id: {0}")]
    InvalidTransactionId(String),
    #[error("line {line}: malformed transaction: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode transaction: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to read transactions: {0}")]
    Read(#[from] std::io::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub caller: AccountId,
    pub call: Call,
}

impl Transaction {
    pub fn new(caller: impl Into<AccountId>, call: Call) -> Self {
        Self {
            id: None,
            caller: caller.into(),
            call,
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct Receipt {
    pub tx_id: TxId,
    pub height: u64,
    pub op: &'static str,
    #[serde(flatten)]
    pub result: CallResult,
}

#[derive(Clone, Debug, Default)]
pub struct Host {
    ledger: JobLedger,
    meta: SnapshotMetadata,
    applied: BTreeSet<TxId>,
}

impl Host {
    pub fn new(limits: LedgerLimits) -> Self {
        Self {
            ledger: JobLedger::with_limits(limits),
            ..Self::default()
        }
    }

    pub fn from_snapshot(snapshot: LedgerSnapshot, limits: LedgerLimits) -> Self {
        let mut ledger = snapshot.ledger;
        ledger.set_limits(limits);
        Self {
            ledger,
            meta: snapshot.meta,
            applied: snapshot.applied,
        }
    }

    /// Loads the snapshot at `path`, or starts empty when there is none.
    /// Digests, sequencing and ledger invariants are all checked first.
    pub fn load(path: &Path, limits: LedgerLimits) -> Result<Self, StoreError> {
        match LedgerSnapshot::read_from(path)? {
            Some(snapshot) => {
                info!(
                    path = %path.display(),
                    height = snapshot.meta.height,
                    root = %snapshot.state_root,
                    "snapshot loaded"
                );
                Ok(Self::from_snapshot(snapshot, limits))
            }
            None => {
                info!(path = %path.display(), "no snapshot, starting empty ledger");
                Ok(Self::new(limits))
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let snapshot = self.snapshot();
        snapshot.write_to(path)?;
        info!(
            path = %path.display(),
            height = snapshot.meta.height,
            root = %snapshot.state_root,
            "snapshot saved"
        );
        Ok(())
    }

    pub fn ledger(&self) -> &JobLedger {
        &self.ledger
    }

    pub fn meta(&self) -> &SnapshotMetadata {
        &self.meta
    }

    pub fn state_root(&self) -> Digest32 {
        compute_state_root(&self.ledger)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot::new(self.meta.clone(), self.ledger.clone(), self.applied.clone())
    }

    /// Applies one transaction. Rejected calls are still sequenced: they
    /// consume a height and their id, but leave the ledger unchanged.
    pub fn execute(&mut self, tx: &Transaction) -> Result<Receipt, HostError> {
        let tx_id: TxId = match &tx.id {
            Some(raw) => raw.parse().map_err(HostError::InvalidTransactionId)?,
            None => self.derive_tx_id(tx)?,
        };
        if self.applied.contains(&tx_id) {
            return Err(HostError::DuplicateTransaction(tx_id));
        }

        let result = call::dispatch(&mut self.ledger, &tx.caller, &tx.call);
        match result.error() {
            Some(error) => warn!(
                tx = %tx_id,
                op = tx.call.name(),
                caller = %tx.caller,
                %error,
                "call rejected"
            ),
            None => debug!(tx = %tx_id, op = tx.call.name(), caller = %tx.caller, "call applied"),
        }

        self.applied.insert(tx_id);
        self.meta.height += 1;
        self.meta.previous_tx = Some(tx_id);
        Ok(Receipt {
            tx_id,
            height: self.meta.height,
            op: tx.call.name(),
            result,
        })
    }

    /// Applies newline-delimited JSON transactions in order. Blank lines and
    /// `#` comments are skipped; duplicates are logged and skipped.
    pub fn replay(&mut self, input: impl BufRead) -> Result<Vec<Receipt>, HostError> {
        let mut receipts = Vec::new();
        for (idx, line) in input.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let tx: Transaction = serde_json::from_str(trimmed).map_err(|source| {
                HostError::Parse {
                    line: idx + 1,
                    source,
                }
            })?;
            match self.execute(&tx) {
                Ok(receipt) => receipts.push(receipt),
                Err(HostError::DuplicateTransaction(id)) => {
                    warn!(line = idx + 1, tx = %id, "duplicate transaction skipped");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(receipts)
    }

    fn derive_tx_id(&self, tx: &Transaction) -> Result<TxId, HostError> {
        let mut hasher = Sha256::new();
        hasher.update(b"escrow-tx");
        hasher.update(self.meta.height.to_le_bytes());
        hasher.update((tx.caller.len() as u64).to_le_bytes());
        hasher.update(tx.caller.as_bytes());
        hasher.update(serde_json::to_vec(&tx.call)?);
        Ok(Digest32(hasher.finalize().into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{ErrorKind, JobStatus};
    use serde_json::json;

    const CLIENT: &str = "ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM";
    const FREELANCER: &str = "ST2CY5V39NHDPWSXMW9QDT3HC3GD6Q6XX4CFRK9AG";

    fn create_job() -> Transaction {
        Transaction::new(
            CLIENT,
            Call::CreateJob {
                freelancer: Some(FREELANCER.into()),
                title: "Build Website".into(),
                amount: 5000,
            },
        )
    }

    const SCRIPT: &str = r#"
# website job
{"caller":"ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM","call":{"op":"create_job","freelancer":"ST2CY5V39NHDPWSXMW9QDT3HC3GD6Q6XX4CFRK9AG","title":"Build Website","amount":5000}}
{"caller":"ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM","call":{"op":"add_milestone","job_id":1,"description":"Design Phase","amount":1000}}

{"caller":"ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM","call":{"op":"start_job","job_id":1}}
{"caller":"ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM","call":{"op":"start_job","job_id":1}}
"#;

    #[test]
    fn replay_applies_script_in_order() {
        let mut host = Host::default();
        let receipts = host.replay(SCRIPT.as_bytes()).unwrap();
        assert_eq!(receipts.len(), 4);
        assert_eq!(receipts[0].result.value(), Some(&json!(1)));
        assert_eq!(receipts[1].result.value(), Some(&json!(1)));
        assert!(receipts[2].result.is_success());
        assert_eq!(receipts[3].result.error(), Some(ErrorKind::InvalidState));
        assert_eq!(host.meta().height, 4);
        assert_eq!(
            host.ledger().get_job(1).unwrap().status,
            JobStatus::Active
        );

        let line = serde_json::to_value(&receipts[3]).unwrap();
        assert_eq!(line["height"], json!(4));
        assert_eq!(line["op"], json!("start_job"));
        assert_eq!(line["success"], json!(false));
        assert_eq!(line["error"], json!("InvalidState"));
    }

    #[test]
    fn explicit_ids_are_applied_once() {
        let mut host = Host::default();
        let mut tx = create_job();
        tx.id = Some("11".repeat(32));
        host.execute(&tx).unwrap();
        let err = host.execute(&tx).unwrap_err();
        assert!(matches!(err, HostError::DuplicateTransaction(id) if id.0 == [0x11; 32]));
        assert_eq!(host.meta().height, 1);
        assert_eq!(host.ledger().next_job_id(), 2);

        tx.id = Some("not-hex".into());
        assert!(matches!(
            host.execute(&tx).unwrap_err(),
            HostError::InvalidTransactionId(_)
        ));
    }

    #[test]
    fn derived_ids_differ_by_height() {
        let mut host = Host::default();
        let first = host.execute(&create_job()).unwrap();
        let second = host.execute(&create_job()).unwrap();
        assert_ne!(first.tx_id, second.tx_id);
        assert_eq!(host.meta().previous_tx, Some(second.tx_id));
        assert_eq!(second.result.value(), Some(&json!(2)));
    }

    #[test]
    fn rejected_calls_advance_height_only() {
        let mut host = Host::default();
        host.execute(&create_job()).unwrap();
        let root = host.state_root();
        let receipt = host
            .execute(&Transaction::new(FREELANCER, Call::CancelJob { job_id: 1 }))
            .unwrap();
        assert_eq!(receipt.result.error(), Some(ErrorKind::Unauthorized));
        assert_eq!(host.meta().height, 2);
        assert_eq!(host.state_root(), root);
    }

    #[test]
    fn malformed_lines_report_their_position() {
        let mut host = Host::default();
        let err = host
            .replay("\n{\"caller\":\"a\",\"call\":{\"op\":\"launch\"}}\n".as_bytes())
            .unwrap_err();
        assert!(matches!(err, HostError::Parse { line: 2, .. }));
    }

    #[test]
    fn snapshot_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("escrow.json");

        let mut host = Host::load(&path, LedgerLimits::default()).unwrap();
        assert_eq!(host.meta().height, 0);
        host.replay(SCRIPT.as_bytes()).unwrap();
        host.save(&path).unwrap();

        let mut restored = Host::load(&path, LedgerLimits::default()).unwrap();
        assert_eq!(restored.meta(), host.meta());
        assert_eq!(restored.state_root(), host.state_root());
        assert_eq!(restored.ledger().get_milestone(1, 1).unwrap().amount, 1000);

        // Counters continue where they stopped.
        let receipt = restored.execute(&create_job()).unwrap();
        assert_eq!(receipt.result.value(), Some(&json!(2)));
    }

    #[test]
    fn applied_ids_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("escrow.json");
        let mut tx = create_job();
        tx.id = Some("22".repeat(32));

        let mut host = Host::default();
        host.execute(&tx).unwrap();
        host.save(&path).unwrap();

        let mut restored = Host::load(&path, LedgerLimits::default()).unwrap();
        assert!(matches!(
            restored.execute(&tx),
            Err(HostError::DuplicateTransaction(_))
        ));
    }

    #[test]
    fn tampered_snapshot_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("escrow.json");
        let mut host = Host::default();
        host.replay(SCRIPT.as_bytes()).unwrap();
        host.save(&path).unwrap();

        let mut raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        raw["ledger"]["jobs"]["1"]["amount"] = json!(9_000_000);
        std::fs::write(&path, serde_json::to_vec(&raw).unwrap()).unwrap();

        let err = Host::load(&path, LedgerLimits::default()).unwrap_err();
        assert!(matches!(err, StoreError::RootMismatch { .. }));
    }

    fn saved_website_job(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("escrow.json");
        let mut host = Host::default();
        // Created job with one milestone: the first two transactions.
        let created: Vec<_> = SCRIPT.lines().take(4).collect();
        host.replay(created.join("\n").as_bytes()).unwrap();
        host.save(&path).unwrap();
        path
    }

    fn edit_snapshot(path: &Path, edit: impl FnOnce(&mut serde_json::Value)) {
        let mut raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        edit(&mut raw);
        std::fs::write(path, serde_json::to_vec(&raw).unwrap()).unwrap();
    }

    #[test]
    fn milestone_counter_and_event_log_are_covered_by_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = saved_website_job(&dir);
        edit_snapshot(&path, |raw| raw["ledger"]["jobs"]["1"]["next_milestone_id"] = json!(1));
        assert!(matches!(
            Host::load(&path, LedgerLimits::default()),
            Err(StoreError::RootMismatch { .. })
        ));

        let path = saved_website_job(&dir);
        edit_snapshot(&path, |raw| {
            if let Some(events) = raw["ledger"]["events"].as_array_mut() {
                events.push(json!({
                    "type": "job_started",
                    "job_id": 1,
                    "client": CLIENT,
                    "freelancer": FREELANCER,
                    "amount": 777,
                }));
            }
        });
        assert!(matches!(
            Host::load(&path, LedgerLimits::default()),
            Err(StoreError::RootMismatch { .. })
        ));

        let path = saved_website_job(&dir);
        edit_snapshot(&path, |raw| raw["applied"] = json!([]));
        assert!(matches!(
            Host::load(&path, LedgerLimits::default()),
            Err(StoreError::RootMismatch { .. })
        ));
    }

    /// Recomputing the digests after an edit still fails the ledger checks.
    #[test]
    fn resealed_inconsistent_snapshot_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let edits: [fn(&mut serde_json::Value); 4] = [
            |raw| raw["ledger"]["jobs"]["1"]["next_milestone_id"] = json!(1),
            |raw| raw["ledger"]["milestones"]["1"]["1"]["amount"] = json!(9000),
            |raw| raw["ledger"]["milestones"]["7"] = json!({}),
            |raw| {
                if let Some(events) = raw["ledger"]["events"].as_array_mut() {
                    events.push(json!({
                        "type": "job_started",
                        "job_id": 1,
                        "client": CLIENT,
                        "freelancer": FREELANCER,
                        "amount": 777,
                    }));
                }
            },
        ];
        for edit in edits {
            let path = saved_website_job(&dir);
            edit_snapshot(&path, edit);
            let forged: LedgerSnapshot =
                serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
            LedgerSnapshot::new(forged.meta, forged.ledger, forged.applied)
                .write_to(&path)
                .unwrap();

            assert!(matches!(
                Host::load(&path, LedgerLimits::default()),
                Err(StoreError::Inconsistent(_))
            ));
        }
    }

    #[test]
    fn demo_script_applies_once_across_replays() {
        let script = include_str!("../../demos/website.jsonl");
        let mut host = Host::default();
        let receipts = host.replay(script.as_bytes()).unwrap();
        assert_eq!(receipts.len(), 7);
        assert!(receipts.iter().all(|r| r.result.is_success()));
        assert_eq!(
            host.ledger().get_job(1).unwrap().status,
            JobStatus::Completed
        );

        let root = host.state_root();
        assert!(host.replay(script.as_bytes()).unwrap().is_empty());
        assert_eq!(host.meta().height, 7);
        assert_eq!(host.state_root(), root);
        assert_eq!(host.ledger().next_job_id(), 2);
    }
}
