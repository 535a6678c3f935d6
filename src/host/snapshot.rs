use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::ledger::{
    InvariantViolation, Job, JobId, JobLedger, JobStatus, LedgerEvent, Milestone, MilestoneId,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to access snapshot '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode or decode snapshot: {0}")]
    Json(#[from] serde_json::Error),
    #[error("snapshot digest {stored} does not match recomputed {computed}")]
    RootMismatch { stored: String, computed: String },
    #[error("snapshot sequencing is inconsistent: {reason}")]
    Sequence { reason: &'static str },
    #[error(transparent)]
    Inconsistent(#[from] InvariantViolation),
}

/// 32-byte identifier rendered as lowercase hex.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest32(pub [u8; 32]);

impl fmt::Display for Digest32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for Digest32 {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|e| format!("{e}"))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| format!("expected 32 bytes, got {}", b.len()))?;
        Ok(Digest32(bytes))
    }
}

impl Serialize for Digest32 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest32 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        encoded.parse().map_err(D::Error::custom)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SnapshotMetadata {
    pub height: u64,
    pub previous_tx: Option<Digest32>,
}

/// Persisted host state. `state_root` commits to the ledger alone; `seal`
/// commits to the root together with the sequencing metadata and applied ids.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub meta: SnapshotMetadata,
    pub ledger: JobLedger,
    pub applied: BTreeSet<Digest32>,
    pub state_root: Digest32,
    pub seal: Digest32,
}

impl LedgerSnapshot {
    pub fn new(meta: SnapshotMetadata, ledger: JobLedger, applied: BTreeSet<Digest32>) -> Self {
        let state_root = compute_state_root(&ledger);
        let seal = compute_seal(&meta, &applied, &state_root);
        Self {
            meta,
            ledger,
            applied,
            state_root,
            seal,
        }
    }

    pub fn verify(&self) -> Result<(), StoreError> {
        let root = compute_state_root(&self.ledger);
        check_digest(&self.state_root, &root)?;
        check_digest(&self.seal, &compute_seal(&self.meta, &self.applied, &root))?;

        // Every sequenced transaction consumes one height and one id.
        if self.meta.height != self.applied.len() as u64 {
            return Err(StoreError::Sequence {
                reason: "height differs from the number of applied transactions",
            });
        }
        match &self.meta.previous_tx {
            Some(tx) if !self.applied.contains(tx) => {
                return Err(StoreError::Sequence {
                    reason: "previous transaction is not among the applied ids",
                })
            }
            None if self.meta.height > 0 => {
                return Err(StoreError::Sequence {
                    reason: "previous transaction missing at non-zero height",
                })
            }
            _ => {}
        }
        self.ledger.check_invariants()?;
        Ok(())
    }

    pub fn write_to(&self, path: &Path) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        // Write next to the target and rename so a crash never leaves half a file.
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).map_err(|source| StoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reads and verifies a snapshot; `None` when the file does not exist.
    pub fn read_from(path: &Path) -> Result<Option<Self>, StoreError> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let snapshot: LedgerSnapshot = serde_json::from_slice(&bytes)?;
        snapshot.verify()?;
        Ok(Some(snapshot))
    }
}

fn check_digest(stored: &Digest32, computed: &Digest32) -> Result<(), StoreError> {
    if stored == computed {
        Ok(())
    } else {
        Err(StoreError::RootMismatch {
            stored: stored.to_string(),
            computed: computed.to_string(),
        })
    }
}

/// Commits to every persisted part of the ledger. Each section (counters,
/// jobs, milestone tables, event log) is hashed as a counted sequence of
/// record digests, and the section digests are hashed in a fixed order.
pub fn compute_state_root(ledger: &JobLedger) -> Digest32 {
    let mut counters = Sha256::new();
    counters.update(b"counters");
    counters.update(ledger.next_job_id().to_le_bytes());

    let milestones = ledger.milestone_tables().iter().flat_map(|(job_id, table)| {
        table
            .iter()
            .map(move |(id, milestone)| milestone_leaf(*job_id, *id, milestone))
    });

    let mut root = Sha256::new();
    root.update(b"escrow-ledger/state");
    root.update(counters.finalize());
    root.update(section(b"jobs", ledger.jobs().map(job_leaf)));
    root.update(section(b"milestones", milestones));
    root.update(section(b"events", ledger.events().iter().map(event_leaf)));
    Digest32(root.finalize().into())
}

fn compute_seal(
    meta: &SnapshotMetadata,
    applied: &BTreeSet<Digest32>,
    state_root: &Digest32,
) -> Digest32 {
    let mut hasher = Sha256::new();
    hasher.update(b"escrow-ledger/seal");
    hasher.update(meta.height.to_le_bytes());
    match &meta.previous_tx {
        Some(tx) => {
            hasher.update([1]);
            hasher.update(tx.0);
        }
        None => hasher.update([0]),
    }
    hasher.update(section(b"applied", applied.iter().map(|id| id.0)));
    hasher.update(state_root.0);
    Digest32(hasher.finalize().into())
}

fn section(tag: &[u8], leaves: impl Iterator<Item = [u8; 32]>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(tag);
    let mut count = 0u64;
    for leaf in leaves {
        hasher.update(leaf);
        count += 1;
    }
    hasher.update(count.to_le_bytes());
    hasher.finalize().into()
}

fn job_leaf(job: &Job) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(job.id.to_le_bytes());
    update_str(&mut hasher, &job.client);
    update_opt(&mut hasher, job.freelancer.as_deref());
    update_str(&mut hasher, &job.title);
    hasher.update(job.amount.to_le_bytes());
    hasher.update([status_byte(job.status)]);
    hasher.update(job.next_milestone_id.to_le_bytes());
    hasher.update((job.milestones.len() as u64).to_le_bytes());
    for id in &job.milestones {
        hasher.update(id.to_le_bytes());
    }
    hasher.finalize().into()
}

/// Table keys are hashed next to the record's own ids so a record filed
/// under the wrong job or id changes the root.
fn milestone_leaf(job_key: JobId, id_key: MilestoneId, milestone: &Milestone) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(job_key.to_le_bytes());
    hasher.update(id_key.to_le_bytes());
    hasher.update(milestone.job_id.to_le_bytes());
    hasher.update(milestone.id.to_le_bytes());
    update_str(&mut hasher, &milestone.description);
    hasher.update(milestone.amount.to_le_bytes());
    hasher.update([u8::from(milestone.completed)]);
    hasher.finalize().into()
}

fn event_leaf(event: &LedgerEvent) -> [u8; 32] {
    let mut hasher = Sha256::new();
    match event {
        LedgerEvent::JobCreated {
            job_id,
            client,
            freelancer,
            amount,
        } => {
            hasher.update([0]);
            hasher.update(job_id.to_le_bytes());
            update_str(&mut hasher, client);
            update_opt(&mut hasher, freelancer.as_deref());
            hasher.update(amount.to_le_bytes());
        }
        LedgerEvent::FreelancerAssigned { job_id, freelancer } => {
            hasher.update([1]);
            hasher.update(job_id.to_le_bytes());
            update_str(&mut hasher, freelancer);
        }
        LedgerEvent::MilestoneAdded {
            job_id,
            milestone_id,
            amount,
        } => {
            hasher.update([2]);
            hasher.update(job_id.to_le_bytes());
            hasher.update(milestone_id.to_le_bytes());
            hasher.update(amount.to_le_bytes());
        }
        LedgerEvent::JobStarted {
            job_id,
            client,
            freelancer,
            amount,
        } => {
            hasher.update([3]);
            hasher.update(job_id.to_le_bytes());
            update_str(&mut hasher, client);
            update_str(&mut hasher, freelancer);
            hasher.update(amount.to_le_bytes());
        }
        LedgerEvent::MilestoneCompleted {
            job_id,
            milestone_id,
            freelancer,
            amount,
        } => {
            hasher.update([4]);
            hasher.update(job_id.to_le_bytes());
            hasher.update(milestone_id.to_le_bytes());
            update_str(&mut hasher, freelancer);
            hasher.update(amount.to_le_bytes());
        }
        LedgerEvent::JobCompleted {
            job_id,
            client,
            unallocated,
        } => {
            hasher.update([5]);
            hasher.update(job_id.to_le_bytes());
            update_str(&mut hasher, client);
            hasher.update(unallocated.to_le_bytes());
        }
        LedgerEvent::JobCancelled {
            job_id,
            client,
            refundable,
        } => {
            hasher.update([6]);
            hasher.update(job_id.to_le_bytes());
            update_str(&mut hasher, client);
            hasher.update(refundable.to_le_bytes());
        }
    }
    hasher.finalize().into()
}

fn update_str(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}

fn update_opt(hasher: &mut Sha256, value: Option<&str>) {
    match value {
        Some(value) => {
            hasher.update([1]);
            update_str(hasher, value);
        }
        None => hasher.update([0]),
    }
}

fn status_byte(status: JobStatus) -> u8 {
    match status {
        JobStatus::Created => 0,
        JobStatus::Active => 1,
        JobStatus::Completed => 2,
        JobStatus::Cancelled => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_root_is_deterministic_and_tracks_changes() {
        let mut ledger = JobLedger::new();
        let empty = compute_state_root(&ledger);
        assert_eq!(empty, compute_state_root(&JobLedger::new()));

        let job_id = ledger.create_job("alice", Some("bob"), "Logo", 100).unwrap();
        let with_job = compute_state_root(&ledger);
        assert_ne!(empty, with_job);
        assert_eq!(with_job, compute_state_root(&ledger.clone()));

        ledger.add_milestone("alice", job_id, "draft", 50).unwrap();
        assert_ne!(with_job, compute_state_root(&ledger));
    }

    #[test]
    fn root_covers_counters_tables_and_events() {
        let mut ledger = JobLedger::new();
        ledger.create_job("alice", Some("bob"), "Logo", 100).unwrap();
        ledger.add_milestone("alice", 1, "draft", 50).unwrap();
        let root = compute_state_root(&ledger);

        let edits: [fn(&mut serde_json::Value); 4] = [
            |raw| raw["jobs"]["1"]["next_milestone_id"] = serde_json::json!(7),
            |raw| raw["jobs"]["1"]["milestones"] = serde_json::json!([]),
            |raw| raw["milestones"]["5"] = serde_json::json!({}),
            |raw| raw["events"][1]["amount"] = serde_json::json!(49),
        ];
        for edit in edits {
            let mut raw = serde_json::to_value(&ledger).unwrap();
            edit(&mut raw);
            let forged: JobLedger = serde_json::from_value(raw).unwrap();
            assert_ne!(compute_state_root(&forged), root);
        }
    }

    #[test]
    fn seal_covers_height_and_applied_ids() {
        let id = Digest32([7; 32]);
        let meta = SnapshotMetadata {
            height: 1,
            previous_tx: Some(id),
        };
        let snapshot = LedgerSnapshot::new(meta.clone(), JobLedger::new(), BTreeSet::from([id]));
        snapshot.verify().unwrap();

        let mut dropped = snapshot.clone();
        dropped.applied.clear();
        assert!(matches!(
            dropped.verify(),
            Err(StoreError::RootMismatch { .. })
        ));

        // Resealing does not help when height and applied ids disagree.
        let resealed = LedgerSnapshot::new(meta, JobLedger::new(), BTreeSet::new());
        assert!(matches!(
            resealed.verify(),
            Err(StoreError::Sequence { .. })
        ));
    }

    #[test]
    fn digest_parses_only_32_byte_hex() {
        let id: Digest32 = "ab".repeat(32).parse().unwrap();
        assert_eq!(id.0, [0xab; 32]);
        assert_eq!(id.to_string(), "ab".repeat(32));
        assert!("abcd".parse::<Digest32>().is_err());
        assert!("zz".repeat(32).parse::<Digest32>().is_err());
    }
}
