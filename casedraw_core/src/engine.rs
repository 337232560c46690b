use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::commitment::{CommitmentManager, CommitmentState};
use crate::error::DrawError;
use crate::ledger::Ledger;
use crate::rng::derive_roll;
use crate::store::DrawStore;
use crate::weights::WeightTable;

/// Outcome of the deterministic selection step, before any settlement.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub index: usize,
    pub outcome_id: String,
    pub roll: u64,
    pub point: u64,
    pub derived_value: f64,
}

/// Pick the outcome for `(server_seed, client_seed, sequence)` from `table`:
/// `point = roll mod total`, then the first interval containing `point`.
pub fn select(
    server_seed: &str,
    client_seed: &str,
    sequence: u64,
    table: &WeightTable,
) -> Result<Selection, DrawError> {
    let roll = derive_roll(server_seed, client_seed, sequence)?;
    Ok(select_from_roll(roll, table))
}

pub fn select_from_roll(roll: u64, table: &WeightTable) -> Selection {
    let total = table.total_weight();
    let point = roll % total;
    // point < total and the bounds cover [0, total) contiguously
    let index = table.locate(point).unwrap_or(table.len() - 1);
    Selection {
        index,
        outcome_id: table.entries()[index].outcome_id.clone(),
        roll,
        point,
        derived_value: point as f64 / total as f64,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawRequest {
    pub draw_id: Uuid,
    pub client_seed: String,
    pub sequence: u64,
    pub table_id: String,
}

/// Who pays for a draw and how much.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wager {
    pub account_id: String,
    pub price: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawResult {
    pub draw_id: Uuid,
    pub table_id: String,
    pub table_fingerprint: String,
    pub outcome_id: String,
    pub server_seed: String,
    pub server_seed_hash: String,
    pub client_seed: String,
    pub sequence: u64,
    pub roll: u64,
    pub point: u64,
    pub derived_value: f64,
    pub account_id: String,
    pub price: u64,
    pub payout: u64,
    pub finalized_at: DateTime<Utc>,
}

pub struct DrawEngine<L, S> {
    commitments: Arc<CommitmentManager>,
    ledger: L,
    store: S,
}

impl<L: Ledger, S: DrawStore> DrawEngine<L, S> {
    pub fn new(commitments: Arc<CommitmentManager>, ledger: L, store: S) -> Self {
        Self {
            commitments,
            ledger,
            store,
        }
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Consume `request`: select the outcome, then settle debit, credit and
    /// result as one unit through the ledger, all while holding the draw's
    /// lock. A failed settlement leaves no result and no balance change; the
    /// sequence stays spent only when the debit had gone through.
    pub async fn finalize(&self, request: DrawRequest, wager: &Wager) -> Result<DrawResult, DrawError> {
        let draw_id = request.draw_id;
        let handle = self.commitments.record(&draw_id, &self.store).await?;
        let mut record = handle.lock().await;

        if record.result.is_some() {
            warn!(draw_id = %draw_id, "finalize refused: already finalized");
            return Err(DrawError::AlreadyFinalized { draw_id });
        }
        let now = self.commitments.now();
        if record.commitment.state != CommitmentState::Open || record.expire_if_due(now) {
            warn!(draw_id = %draw_id, state = ?record.commitment.state, "finalize refused: commitment not open");
            return Err(DrawError::CommitmentNotOpen { draw_id });
        }
        if request.sequence < record.next_sequence {
            warn!(draw_id = %draw_id, sequence = request.sequence, "finalize refused: sequence replay");
            return Err(DrawError::SequenceReplay {
                draw_id,
                sequence: request.sequence,
                next: record.next_sequence,
            });
        }
        if request.table_id != record.table.id {
            return Err(DrawError::TableMismatch {
                draw_id,
                committed: record.table.id.clone(),
                requested: request.table_id,
            });
        }
        if wager.price != record.table.price {
            return Err(DrawError::PriceMismatch {
                offered: wager.price,
                expected: record.table.price,
            });
        }

        let selection = select(
            record.server_seed().expose(),
            &request.client_seed,
            request.sequence,
            &record.table.weights,
        )?;
        let payout = record.table.payout(&selection.outcome_id);
        let result = DrawResult {
            draw_id,
            table_id: record.table.id.clone(),
            table_fingerprint: record.commitment.table_fingerprint.clone(),
            outcome_id: selection.outcome_id,
            server_seed: record.server_seed().expose().to_string(),
            server_seed_hash: record.commitment.server_seed_hash.clone(),
            client_seed: request.client_seed,
            sequence: request.sequence,
            roll: selection.roll,
            point: selection.point,
            derived_value: selection.derived_value,
            account_id: wager.account_id.clone(),
            price: wager.price,
            payout,
            finalized_at: now,
        };

        let next_sequence = request.sequence.saturating_add(1);
        if let Err(e) = self.ledger.settle(&result, &self.store).await {
            if e.debited {
                // the wager was taken and given back: this sequence is spent
                record.next_sequence = next_sequence;
                if let Err(se) = self.store.consume_sequence(draw_id, next_sequence).await {
                    error!(draw_id = %draw_id, error = %se, "could not persist spent sequence");
                }
            }
            warn!(draw_id = %draw_id, sequence = result.sequence, error = %e, "settlement failed");
            return Err(e.error);
        }

        record.next_sequence = next_sequence;
        record.result = Some(result.clone());
        drop(record);
        // the durable copy now answers reveal and audit lookups
        self.commitments.evict(&draw_id);
        info!(
            draw_id = %draw_id,
            account = %wager.account_id,
            sequence = result.sequence,
            outcome = %result.outcome_id,
            point = result.point,
            payout,
            "draw finalized"
        );
        Ok(result)
    }
}
