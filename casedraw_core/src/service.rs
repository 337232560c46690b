use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::commitment::{Clock, Commitment, CommitmentManager, CommitmentState, SystemClock};
use crate::engine::{DrawEngine, DrawRequest, DrawResult, Wager};
use crate::error::DrawError;
use crate::ledger::Ledger;
use crate::rng;
use crate::store::DrawStore;
use crate::tables::TableRegistry;

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// How long an unconsumed commitment stays usable.
    pub commitment_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            commitment_ttl: Duration::seconds(300),
        }
    }
}

/// What the player learns right after a draw; the seed comes later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawReceipt {
    pub draw_id: Uuid,
    pub outcome_id: String,
    pub sequence: u64,
    pub payout: u64,
}

/// The commit, draw, reveal surface over one ledger and one result store.
pub struct DrawService<L, S> {
    tables: TableRegistry,
    commitments: Arc<CommitmentManager>,
    engine: DrawEngine<L, S>,
}

impl<L: Ledger, S: DrawStore> DrawService<L, S> {
    pub fn new(config: EngineConfig, tables: TableRegistry, ledger: L, store: S) -> Result<Self, DrawError> {
        Self::with_clock(config, tables, ledger, store, Arc::new(SystemClock))
    }

    /// Fails if the digest primitives do not pass their known-answer test.
    pub fn with_clock(
        config: EngineConfig,
        tables: TableRegistry,
        ledger: L,
        store: S,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DrawError> {
        rng::self_test()?;
        let commitments = Arc::new(CommitmentManager::new(config.commitment_ttl, clock));
        Ok(Self {
            tables,
            engine: DrawEngine::new(commitments.clone(), ledger, store),
            commitments,
        })
    }

    pub fn tables(&self) -> &TableRegistry {
        &self.tables
    }

    pub fn ledger(&self) -> &L {
        self.engine.ledger()
    }

    pub fn store(&self) -> &S {
        self.engine.store()
    }

    pub async fn open_commitment(&self, table_id: &str) -> Result<Commitment, DrawError> {
        let table = self.tables.get(table_id).ok_or_else(|| DrawError::UnknownTable {
            table_id: table_id.to_string(),
        })?;
        self.commitments.open(table, self.engine.store()).await
    }

    /// Draw against an open commitment using its next unconsumed sequence.
    pub async fn submit_draw(
        &self,
        account_id: &str,
        draw_id: Uuid,
        client_seed: &str,
        price: u64,
    ) -> Result<DrawReceipt, DrawError> {
        let handle = self.commitments.record(&draw_id, self.engine.store()).await?;
        let (sequence, table_id) = {
            let record = handle.lock().await;
            (record.next_sequence, record.table.id.clone())
        };
        // a concurrent submit may consume this sequence first; finalize
        // re-checks under the lock and refuses the loser
        let request = DrawRequest {
            draw_id,
            client_seed: client_seed.to_string(),
            sequence,
            table_id,
        };
        let wager = Wager {
            account_id: account_id.to_string(),
            price,
        };
        debug!(draw_id = %draw_id, sequence, "submitting draw");
        let result = self.engine.finalize(request, &wager).await?;
        Ok(DrawReceipt {
            draw_id,
            outcome_id: result.outcome_id,
            sequence: result.sequence,
            payout: result.payout,
        })
    }

    pub async fn finalize(&self, request: DrawRequest, wager: &Wager) -> Result<DrawResult, DrawError> {
        self.engine.finalize(request, wager).await
    }

    pub async fn reveal_seed(&self, draw_id: Uuid) -> Result<String, DrawError> {
        let seed = self.commitments.reveal(&draw_id, self.engine.store()).await?;
        Ok(seed.expose().to_string())
    }

    pub async fn commitment(&self, draw_id: Uuid) -> Result<Commitment, DrawError> {
        self.commitments.commitment(&draw_id, self.engine.store()).await
    }

    /// The stored result and commitment state of a draw, with the server seed
    /// blanked unless it has been revealed.
    pub async fn public_result(&self, draw_id: Uuid) -> Result<Option<(DrawResult, CommitmentState)>, DrawError> {
        let Some(stored) = self.engine.store().load(draw_id).await? else {
            return Ok(None);
        };
        let Some(mut result) = stored.result else {
            return Ok(None);
        };
        let state = if stored.revealed_at.is_some() {
            CommitmentState::Revealed
        } else {
            stored.commitment.state
        };
        if state != CommitmentState::Revealed {
            result.server_seed.clear();
        }
        Ok(Some((result, state)))
    }

    /// Drop expired, unconsumed commitments from memory and the store.
    pub async fn purge_expired(&self) -> Result<usize, DrawError> {
        self.commitments.purge_expired(self.engine.store()).await
    }

    /// Draws currently held in memory: open commitments not yet finalized.
    pub fn open_draws(&self) -> usize {
        self.commitments.len()
    }
}
