use anyhow::{anyhow, Error};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PayoutStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl PayoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutStatus::Pending => "PENDING",
            PayoutStatus::Processing => "PROCESSING",
            PayoutStatus::Completed => "COMPLETED",
            PayoutStatus::Failed => "FAILED",
        }
    }

    /// No transition is expected out of a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PayoutStatus::Completed | PayoutStatus::Failed)
    }

    /// Label written back to origin records when a payout settles.
    pub fn terminal_label(&self) -> Option<&'static str> {
        match self {
            PayoutStatus::Completed => Some("completed"),
            PayoutStatus::Failed => Some("failed"),
            _ => None,
        }
    }
}

impl FromStr for PayoutStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(PayoutStatus::Pending),
            "PROCESSING" => Ok(PayoutStatus::Processing),
            "COMPLETED" => Ok(PayoutStatus::Completed),
            "FAILED" => Ok(PayoutStatus::Failed),
            other => Err(anyhow!("unknown payout status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PayoutMethod {
    LinePay,
    BankTransfer,
    Cash,
}

impl PayoutMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutMethod::LinePay => "LINE_PAY",
            PayoutMethod::BankTransfer => "BANK_TRANSFER",
            PayoutMethod::Cash => "CASH",
        }
    }
}

impl FromStr for PayoutMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LINE_PAY" => Ok(PayoutMethod::LinePay),
            "BANK_TRANSFER" => Ok(PayoutMethod::BankTransfer),
            "CASH" => Ok(PayoutMethod::Cash),
            other => Err(anyhow!("unknown payout method: {other}")),
        }
    }
}

/// One disbursement to carry out, as submitted by a back-office module
/// (expense reimbursement, dividend payout run, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutRequest {
    /// Amount in minor currency units. Must be positive.
    pub amount: i64,
    pub description: String,
    pub method: PayoutMethod,
    /// Provider-specific destination: LINE user id, `bank-code:account`, ...
    pub target_identifier: String,
    pub employee_id: String,
    pub tenant_id: String,
    pub reference_id: String,
    pub reference_type: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// One entry of a payout's append-only status trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusEntry {
    pub status: PayoutStatus,
    pub at: DateTime<Utc>,
    pub note: String,
}

/// The durable unit of work tracking one disbursement's lifecycle.
/// Created once at intake, mutated only through the status engine, never
/// deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutRecord {
    pub id: String,
    pub batch_id: String,
    pub status: PayoutStatus,
    pub method: PayoutMethod,
    pub amount: i64,
    pub description: String,
    pub target_identifier: String,
    pub employee_id: String,
    pub tenant_id: String,
    pub reference_id: String,
    pub reference_type: String,
    pub provider_payout_id: Option<String>,
    pub completion_time: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub processing_time: Option<DateTime<Utc>>,
    pub metadata: Map<String, Value>,
    pub status_history: Vec<StatusEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields merged into a payout by the status engine alongside a transition.
/// Known fields map to their own columns; `extra` is shallow-merged into the
/// record's open metadata map, new keys winning.
#[derive(Debug, Clone, Default)]
pub struct PayoutUpdate {
    pub provider_payout_id: Option<String>,
    pub completion_time: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub processing_time: Option<DateTime<Utc>>,
    pub extra: Map<String, Value>,
}
