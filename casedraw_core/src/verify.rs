// Pure recomputation of a draw from its revealed inputs.

use serde::{Deserialize, Serialize};

use crate::engine::{select, DrawResult};
use crate::rng::derive_hash_hex;
use crate::weights::WeightTable;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum InvalidReason {
    /// `sha256(server_seed)` differs from the published commitment hash.
    CommitmentMismatch { expected: String, actual: String },
    /// The table snapshot is not the one committed to.
    TableMismatch { expected: String, actual: String },
    RollMismatch { claimed: u64, actual: u64 },
    OutcomeMismatch { claimed: String, actual: String },
    Digest { message: String },
}

impl std::fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CommitmentMismatch { expected, actual } => {
                write!(f, "seed hash {actual} does not match commitment {expected}")
            }
            Self::TableMismatch { expected, actual } => {
                write!(f, "table fingerprint {actual} does not match committed {expected}")
            }
            Self::RollMismatch { claimed, actual } => {
                write!(f, "claimed roll {claimed} but inputs give {actual}")
            }
            Self::OutcomeMismatch { claimed, actual } => {
                write!(f, "claimed outcome {claimed} but inputs give {actual}")
            }
            Self::Digest { message } => write!(f, "digest failure: {message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Valid,
    Invalid(InvalidReason),
}

impl Verdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, Verdict::Valid)
    }
}

/// Inputs of one verification. The optional claims tighten the check; with
/// none of them only the outcome is compared.
#[derive(Debug, Clone)]
pub struct Verification<'a> {
    pub server_seed: &'a str,
    pub client_seed: &'a str,
    pub sequence: u64,
    pub table: &'a WeightTable,
    pub claimed_outcome: &'a str,
    pub commitment_hash: Option<&'a str>,
    pub table_fingerprint: Option<&'a str>,
    pub claimed_roll: Option<u64>,
}

impl<'a> Verification<'a> {
    pub fn new(
        server_seed: &'a str,
        client_seed: &'a str,
        sequence: u64,
        table: &'a WeightTable,
        claimed_outcome: &'a str,
    ) -> Self {
        Self {
            server_seed,
            client_seed,
            sequence,
            table,
            claimed_outcome,
            commitment_hash: None,
            table_fingerprint: None,
            claimed_roll: None,
        }
    }

    /// Verify every field a stored result carries against `table`.
    pub fn of_result(result: &'a DrawResult, table: &'a WeightTable) -> Self {
        Self::new(
            &result.server_seed,
            &result.client_seed,
            result.sequence,
            table,
            &result.outcome_id,
        )
        .with_commitment(&result.server_seed_hash)
        .with_table_fingerprint(&result.table_fingerprint)
        .with_roll(result.roll)
    }

    pub fn with_commitment(mut self, hash: &'a str) -> Self {
        self.commitment_hash = Some(hash);
        self
    }

    pub fn with_table_fingerprint(mut self, fingerprint: &'a str) -> Self {
        self.table_fingerprint = Some(fingerprint);
        self
    }

    pub fn with_roll(mut self, roll: u64) -> Self {
        self.claimed_roll = Some(roll);
        self
    }

    pub fn run(&self) -> Verdict {
        if let Some(expected) = self.commitment_hash {
            let actual = derive_hash_hex(self.server_seed.as_bytes());
            if !actual.eq_ignore_ascii_case(expected) {
                return Verdict::Invalid(InvalidReason::CommitmentMismatch {
                    expected: expected.to_string(),
                    actual,
                });
            }
        }
        if let Some(expected) = self.table_fingerprint {
            let actual = self.table.fingerprint();
            if !actual.eq_ignore_ascii_case(expected) {
                return Verdict::Invalid(InvalidReason::TableMismatch {
                    expected: expected.to_string(),
                    actual,
                });
            }
        }
        let selection = match select(self.server_seed, self.client_seed, self.sequence, self.table) {
            Ok(s) => s,
            Err(e) => {
                return Verdict::Invalid(InvalidReason::Digest {
                    message: e.to_string(),
                })
            }
        };
        if let Some(claimed) = self.claimed_roll {
            if claimed != selection.roll {
                return Verdict::Invalid(InvalidReason::RollMismatch {
                    claimed,
                    actual: selection.roll,
                });
            }
        }
        if selection.outcome_id != self.claimed_outcome {
            return Verdict::Invalid(InvalidReason::OutcomeMismatch {
                claimed: self.claimed_outcome.to_string(),
                actual: selection.outcome_id,
            });
        }
        Verdict::Valid
    }
}

/// Recompute a draw and compare it with `claimed_outcome`.
pub fn verify(
    server_seed: &str,
    client_seed: &str,
    sequence: u64,
    table: &WeightTable,
    claimed_outcome: &str,
) -> Verdict {
    Verification::new(server_seed, client_seed, sequence, table, claimed_outcome).run()
}
