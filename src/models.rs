use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Success,
    Failure,
}

impl From<bool> for Status {
    fn from(passed: bool) -> Self {
        if passed { Status::Success } else { Status::Failure }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Success => write!(f, "Success"),
            Status::Failure => write!(f, "Failure"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub check_name: String,
    pub result: Status,
    pub response_time: Option<f64>,
}

impl CheckOutcome {
    pub fn new(check_name: impl Into<String>, result: Status, response_time: Option<f64>) -> Self {
        Self {
            check_name: check_name.into(),
            result,
            response_time: response_time.map(round3),
        }
    }
}

pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Persisted document: server name -> ordered outcomes, plus the flush time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(flatten)]
    pub servers: BTreeMap<String, Vec<CheckOutcome>>,
    #[serde(rename = "last-check-time", skip_serializing_if = "Option::is_none")]
    pub last_check_time: Option<String>,
}

impl Snapshot {
    pub fn outcome_count(&self) -> usize {
        self.servers.values().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Failure,
    Warning,
}

/// One delivery to the alert relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertMessage {
    pub chat_id: String,
    pub message: String,
}
