use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenCommitmentRequest {
    pub table_id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CommitmentResponse {
    pub draw_id: Uuid,
    pub server_seed_hash: String,
    pub scheme: String,
    pub table_id: String,
    pub table_fingerprint: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SubmitDrawRequest {
    pub account_id: String,
    pub draw_id: Uuid,
    pub client_seed: String,
    pub price: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SubmitDrawResponse {
    pub draw_id: Uuid,
    pub outcome_id: String,
    pub sequence: u64,
    pub payout: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RevealRequest {
    pub draw_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RevealResponse {
    pub draw_id: Uuid,
    pub server_seed: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct WeightEntry {
    pub outcome_id: String,
    pub weight: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct VerifyRequest {
    pub server_seed: String,
    pub client_seed: String,
    pub sequence: u64,
    pub entries: Vec<WeightEntry>,
    pub claimed_outcome_id: String,
    #[serde(default)]
    pub commitment_hash: Option<String>,
    #[serde(default)]
    pub table_fingerprint: Option<String>,
    #[serde(default)]
    pub roll: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct VerifyResponse {
    pub valid: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TableSnapshot {
    pub id: String,
    pub price: u64,
    pub fingerprint: String,
    pub total_weight: u64,
    pub entries: Vec<WeightEntry>,
    pub payouts: BTreeMap<String, u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AdminUpsertTableRequest {
    pub id: String,
    pub price: u64,
    pub entries: Vec<WeightEntry>,
    pub payouts: BTreeMap<String, u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AdminGrantRequest {
    pub account_id: String,
    pub amount: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BalanceResponse {
    pub account_id: String,
    pub balance: u64,
}

/// Audit view of one draw. `server_seed` is `None` until revealed.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DrawLogEntry {
    pub draw_id: Uuid,
    pub ts: DateTime<Utc>,
    pub account_id: String,
    pub table_id: String,
    pub table_fingerprint: String,
    pub server_seed_hash: String,
    pub server_seed: Option<String>,
    pub client_seed: String,
    pub sequence: u64,
    pub roll: u64,
    pub outcome_id: String,
    pub derived_value: f64,
    pub price: u64,
    pub payout: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LastWin {
    pub outcome_id: String,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StatsResponse {
    pub account_id: String,
    pub balance: u64,
    pub total_spins: u64,
    pub total_won: u64,
    pub last_win: Option<LastWin>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ErrorBody {
    pub error: String,
    pub kind: String,
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{message}")]
    Draw { kind: &'static str, message: String },
    #[error("internal server error")]
    Internal,
}

impl ApiError {
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Invalid(_) => "Invalid",
            ApiError::Unauthorized => "Unauthorized",
            ApiError::NotFound(_) => "NotFound",
            ApiError::Draw { kind, .. } => *kind,
            ApiError::Internal => "Internal",
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error: self.to_string(),
            kind: self.kind().to_string(),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
