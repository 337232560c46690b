use thiserror::Error;
use uuid::Uuid;

use crate::ledger::LedgerError;
use crate::store::StoreError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TableError {
    #[error("weight table has no entries")]
    EmptyTable,

    #[error("outcome {outcome_id} has non-positive weight {weight}")]
    NonPositiveWeight { outcome_id: String, weight: i64 },

    #[error("total weight exceeds 2^53")]
    Overflow,

    #[error("outcome {outcome_id} appears more than once")]
    DuplicateOutcome { outcome_id: String },

    #[error("outcome {outcome_id} has no payout")]
    MissingPayout { outcome_id: String },
}

#[derive(Error, Debug)]
pub enum DrawError {
    #[error(transparent)]
    Table(#[from] TableError),

    #[error("draw table {table_id} not found")]
    UnknownTable { table_id: String },

    #[error("draw {draw_id} not found")]
    NotFound { draw_id: Uuid },

    #[error("draw {draw_id} has already been revealed")]
    AlreadyRevealed { draw_id: Uuid },

    #[error("draw {draw_id} has not been finalized")]
    DrawNotFinalized { draw_id: Uuid },

    #[error("commitment for draw {draw_id} is not open")]
    CommitmentNotOpen { draw_id: Uuid },

    #[error("draw {draw_id} has already been finalized")]
    AlreadyFinalized { draw_id: Uuid },

    #[error("sequence {sequence} already consumed for draw {draw_id} (next: {next})")]
    SequenceReplay {
        draw_id: Uuid,
        sequence: u64,
        next: u64,
    },

    #[error("draw {draw_id} was committed against table {committed}, not {requested}")]
    TableMismatch {
        draw_id: Uuid,
        committed: String,
        requested: String,
    },

    #[error("price {offered} does not match table price {expected}")]
    PriceMismatch { offered: u64, expected: u64 },

    #[error("insufficient balance")]
    InsufficientBalance,

    #[error("ledger: {0}")]
    Ledger(LedgerError),

    #[error("draw store: {0}")]
    Store(#[from] StoreError),

    #[error("digest failure: {0}")]
    Digest(String),
}

impl From<LedgerError> for DrawError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientBalance { .. } => DrawError::InsufficientBalance,
            other => DrawError::Ledger(other),
        }
    }
}

impl DrawError {
    /// Stable machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            DrawError::Table(TableError::EmptyTable) => "EmptyTable",
            DrawError::Table(TableError::NonPositiveWeight { .. }) => "NonPositiveWeight",
            DrawError::Table(TableError::Overflow) => "Overflow",
            DrawError::Table(TableError::DuplicateOutcome { .. }) => "DuplicateOutcome",
            DrawError::Table(TableError::MissingPayout { .. }) => "MissingPayout",
            DrawError::UnknownTable { .. } => "UnknownTable",
            DrawError::NotFound { .. } => "NotFound",
            DrawError::AlreadyRevealed { .. } => "AlreadyRevealed",
            DrawError::DrawNotFinalized { .. } => "DrawNotFinalized",
            DrawError::CommitmentNotOpen { .. } => "CommitmentNotOpen",
            DrawError::AlreadyFinalized { .. } => "AlreadyFinalized",
            DrawError::SequenceReplay { .. } => "SequenceReplay",
            DrawError::TableMismatch { .. } => "TableMismatch",
            DrawError::PriceMismatch { .. } => "PriceMismatch",
            DrawError::InsufficientBalance => "InsufficientBalance",
            DrawError::Ledger(_) => "Ledger",
            DrawError::Store(_) => "Store",
            DrawError::Digest(_) => "Digest",
        }
    }
}
