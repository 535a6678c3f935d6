//! Wire-level call interface.
//!
//! A [`Call`] names one ledger operation; [`dispatch`] applies it on behalf
//! of an already-authenticated caller and wraps the outcome in a
//! [`CallResult`], serialized as `{"success":true,"value":..}` or
//! `{"success":false,"error":"<kind>"}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ledger::{Amount, ErrorKind, JobId, JobLedger, LedgerError, MilestoneId};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Call {
    CreateJob {
        freelancer: Option<String>,
        title: String,
        /// Signed so a negative amount is reported as `InvalidInput`.
        amount: i64,
    },
    AssignFreelancer {
        job_id: JobId,
        freelancer: String,
    },
    AddMilestone {
        job_id: JobId,
        description: String,
        amount: i64,
    },
    StartJob {
        job_id: JobId,
    },
    CompleteMilestone {
        job_id: JobId,
        milestone_id: MilestoneId,
    },
    CancelJob {
        job_id: JobId,
    },
    GetJob {
        job_id: JobId,
    },
    GetMilestone {
        job_id: JobId,
        milestone_id: MilestoneId,
    },
}

impl Call {
    pub fn name(&self) -> &'static str {
        match self {
            Call::CreateJob { .. } => "create_job",
            Call::AssignFreelancer { .. } => "assign_freelancer",
            Call::AddMilestone { .. } => "add_milestone",
            Call::StartJob { .. } => "start_job",
            Call::CompleteMilestone { .. } => "complete_milestone",
            Call::CancelJob { .. } => "cancel_job",
            Call::GetJob { .. } => "get_job",
            Call::GetMilestone { .. } => "get_milestone",
        }
    }

    pub fn is_mutation(&self) -> bool {
        !matches!(self, Call::GetJob { .. } | Call::GetMilestone { .. })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CallResult {
    Ok { success: Success, value: Value },
    Err { success: Failure, error: ErrorKind },
}

impl CallResult {
    pub fn ok(value: Value) -> Self {
        CallResult::Ok {
            success: Success,
            value,
        }
    }

    pub fn err(error: ErrorKind) -> Self {
        CallResult::Err {
            success: Failure,
            error,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CallResult::Ok { .. })
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            CallResult::Ok { value, .. } => Some(value),
            CallResult::Err { .. } => None,
        }
    }

    pub fn error(&self) -> Option<ErrorKind> {
        match self {
            CallResult::Ok { .. } => None,
            CallResult::Err { error, .. } => Some(*error),
        }
    }
}

impl From<Result<Value, LedgerError>> for CallResult {
    fn from(result: Result<Value, LedgerError>) -> Self {
        match result {
            Ok(value) => CallResult::ok(value),
            Err(err) => CallResult::err(err.kind()),
        }
    }
}

/// Literal `true` in the `success` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Success;

/// Literal `false` in the `success` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Failure;

macro_rules! bool_marker {
    ($ty:ident, $value:literal) => {
        impl Serialize for $ty {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_bool($value)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                if bool::deserialize(deserializer)? == $value {
                    Ok($ty)
                } else {
                    Err(serde::de::Error::custom(concat!("expected ", $value)))
                }
            }
        }
    };
}

bool_marker!(Success, true);
bool_marker!(Failure, false);

/// Applies a call to the ledger. Mutations are all-or-nothing.
pub fn dispatch(ledger: &mut JobLedger, caller: &str, call: &Call) -> CallResult {
    execute(ledger, caller, call).into()
}

fn execute(ledger: &mut JobLedger, caller: &str, call: &Call) -> Result<Value, LedgerError> {
    match call {
        Call::CreateJob {
            freelancer,
            title,
            amount,
        } => {
            let amount = to_amount("amount", *amount)?;
            let job_id = ledger.create_job(caller, freelancer.as_deref(), title, amount)?;
            Ok(Value::from(job_id))
        }
        Call::AssignFreelancer { job_id, freelancer } => {
            ledger.assign_freelancer(caller, *job_id, freelancer)?;
            Ok(Value::Bool(true))
        }
        Call::AddMilestone {
            job_id,
            description,
            amount,
        } => {
            let amount = to_amount("amount", *amount)?;
            let milestone_id = ledger.add_milestone(caller, *job_id, description, amount)?;
            Ok(Value::from(milestone_id))
        }
        Call::StartJob { job_id } => {
            ledger.start_job(caller, *job_id)?;
            Ok(Value::Bool(true))
        }
        Call::CompleteMilestone {
            job_id,
            milestone_id,
        } => {
            let status = ledger.complete_milestone(caller, *job_id, *milestone_id)?;
            Ok(Value::from(status.as_str()))
        }
        Call::CancelJob { job_id } => {
            ledger.cancel_job(caller, *job_id)?;
            Ok(Value::Bool(true))
        }
        Call::GetJob { job_id } => to_value(ledger.get_job(*job_id)?),
        Call::GetMilestone {
            job_id,
            milestone_id,
        } => to_value(ledger.get_milestone(*job_id, *milestone_id)?),
    }
}

fn to_amount(field: &str, raw: i64) -> Result<Amount, LedgerError> {
    Amount::try_from(raw).map_err(|_| {
        LedgerError::InvalidInput(format!("{field} must not be negative"))
    })
}

fn to_value<T: Serialize>(record: &T) -> Result<Value, LedgerError> {
    serde_json::to_value(record).map_err(|e| LedgerError::InvalidInput(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const CLIENT: &str = "ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM";
    const FREELANCER: &str = "ST2CY5V39NHDPWSXMW9QDT3HC3GD6Q6XX4CFRK9AG";

    fn parse(raw: Value) -> Call {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn results_use_success_value_shape() {
        let mut ledger = JobLedger::new();
        let created = dispatch(
            &mut ledger,
            CLIENT,
            &parse(json!({
                "op": "create_job",
                "freelancer": FREELANCER,
                "title": "Build Website",
                "amount": 5000
            })),
        );
        assert_eq!(
            serde_json::to_value(&created).unwrap(),
            json!({"success": true, "value": 1})
        );

        let rejected = dispatch(
            &mut ledger,
            FREELANCER,
            &parse(json!({"op": "start_job", "job_id": 1})),
        );
        assert_eq!(
            serde_json::to_value(&rejected).unwrap(),
            json!({"success": false, "error": "Unauthorized"})
        );
    }

    #[test]
    fn result_shape_round_trips() {
        let decoded: CallResult =
            serde_json::from_value(json!({"success": false, "error": "BudgetExceeded"})).unwrap();
        assert_eq!(decoded.error(), Some(ErrorKind::BudgetExceeded));
        assert!(!decoded.is_success());
        let decoded: CallResult =
            serde_json::from_value(json!({"success": true, "value": "active"})).unwrap();
        assert_eq!(decoded.value(), Some(&json!("active")));
    }

    #[test]
    fn negative_amounts_are_invalid_input() {
        let mut ledger = JobLedger::new();
        let result = dispatch(
            &mut ledger,
            CLIENT,
            &Call::CreateJob {
                freelancer: Some(FREELANCER.into()),
                title: "Logo".into(),
                amount: -1,
            },
        );
        assert_eq!(result.error(), Some(ErrorKind::InvalidInput));
        assert_eq!(ledger.next_job_id(), 1);
    }

    #[test]
    fn reads_return_records() {
        let mut ledger = JobLedger::new();
        let calls = [
            json!({"op": "create_job", "freelancer": FREELANCER, "title": "Build Website", "amount": 5000}),
            json!({"op": "add_milestone", "job_id": 1, "description": "Design Phase", "amount": 1000}),
            json!({"op": "start_job", "job_id": 1}),
        ];
        for call in calls {
            assert!(dispatch(&mut ledger, CLIENT, &parse(call)).is_success());
        }

        let job = dispatch(&mut ledger, CLIENT, &parse(json!({"op": "get_job", "job_id": 1})));
        let job = job.value().unwrap();
        assert_eq!(job["status"], json!("active"));
        assert_eq!(job["title"], json!("Build Website"));

        let milestone = dispatch(
            &mut ledger,
            FREELANCER,
            &parse(json!({"op": "get_milestone", "job_id": 1, "milestone_id": 1})),
        );
        assert_eq!(
            milestone.value().unwrap(),
            &json!({
                "id": 1,
                "job_id": 1,
                "description": "Design Phase",
                "amount": 1000,
                "completed": false
            })
        );

        let done = dispatch(
            &mut ledger,
            FREELANCER,
            &parse(json!({"op": "complete_milestone", "job_id": 1, "milestone_id": 1})),
        );
        assert_eq!(done.value(), Some(&json!("completed")));

        let missing = dispatch(&mut ledger, CLIENT, &parse(json!({"op": "get_job", "job_id": 2})));
        assert_eq!(missing.error(), Some(ErrorKind::NotFound));
    }
}
