use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::commitment::{Commitment, CommitmentState};
use crate::engine::DrawResult;
use crate::rng::ServerSeed;
use crate::tables::DrawTable;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("draw {0} already recorded")]
    Duplicate(Uuid),

    #[error("draw {0} not recorded")]
    Missing(Uuid),

    #[error("draw {0} already revealed")]
    AlreadyRevealed(Uuid),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable copy of one draw: the commitment with its private seed and table
/// snapshot, the result once finalized, and the reveal time.
#[derive(Debug, Clone)]
pub struct StoredDraw {
    pub commitment: Commitment,
    pub server_seed: ServerSeed,
    pub table: DrawTable,
    pub next_sequence: u64,
    pub result: Option<DrawResult>,
    pub revealed_at: Option<DateTime<Utc>>,
}

/// Durable record of commitments and finalized draws. The in-memory records
/// are a cache over this; anything not found in memory is reloaded from here.
pub trait DrawStore: Send + Sync {
    /// Persist a freshly opened commitment before its hash is published.
    fn open(&self, draw: &StoredDraw) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn load(&self, draw_id: Uuid) -> impl Future<Output = Result<Option<StoredDraw>, StoreError>> + Send;

    fn record(&self, result: &DrawResult) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Remember that every sequence below `next_sequence` is spent.
    fn consume_sequence(
        &self,
        draw_id: Uuid,
        next_sequence: u64,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Fails with [`StoreError::AlreadyRevealed`] when a reveal is already on
    /// record, so two racing reveals cannot both succeed.
    fn mark_revealed(
        &self,
        draw_id: Uuid,
        revealed_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Delete unfinalized commitments whose expiry is at or before `now`.
    fn purge_expired(&self, now: DateTime<Utc>) -> impl Future<Output = Result<usize, StoreError>> + Send;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    draws: Mutex<HashMap<Uuid, StoredDraw>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, draw_id: &Uuid) -> Option<StoredDraw> {
        self.lock().get(draw_id).cloned()
    }

    /// Number of finalized draws on record.
    pub fn results(&self) -> usize {
        self.lock().values().filter(|d| d.result.is_some()).count()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, StoredDraw>> {
        self.draws.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl DrawStore for MemoryStore {
    async fn open(&self, draw: &StoredDraw) -> Result<(), StoreError> {
        let mut draws = self.lock();
        let draw_id = draw.commitment.draw_id;
        if draws.contains_key(&draw_id) {
            return Err(StoreError::Duplicate(draw_id));
        }
        draws.insert(draw_id, draw.clone());
        Ok(())
    }

    async fn load(&self, draw_id: Uuid) -> Result<Option<StoredDraw>, StoreError> {
        Ok(self.get(&draw_id))
    }

    async fn record(&self, result: &DrawResult) -> Result<(), StoreError> {
        let mut draws = self.lock();
        let stored = draws
            .get_mut(&result.draw_id)
            .ok_or(StoreError::Missing(result.draw_id))?;
        if stored.result.is_some() {
            return Err(StoreError::Duplicate(result.draw_id));
        }
        stored.next_sequence = stored.next_sequence.max(result.sequence.saturating_add(1));
        stored.result = Some(result.clone());
        Ok(())
    }

    async fn consume_sequence(&self, draw_id: Uuid, next_sequence: u64) -> Result<(), StoreError> {
        let mut draws = self.lock();
        let stored = draws.get_mut(&draw_id).ok_or(StoreError::Missing(draw_id))?;
        stored.next_sequence = stored.next_sequence.max(next_sequence);
        Ok(())
    }

    async fn mark_revealed(&self, draw_id: Uuid, revealed_at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut draws = self.lock();
        let stored = draws.get_mut(&draw_id).ok_or(StoreError::Missing(draw_id))?;
        if stored.revealed_at.is_some() {
            return Err(StoreError::AlreadyRevealed(draw_id));
        }
        if stored.result.is_none() {
            return Err(StoreError::Missing(draw_id));
        }
        stored.revealed_at = Some(revealed_at);
        stored.commitment.state = CommitmentState::Revealed;
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut draws = self.lock();
        let before = draws.len();
        draws.retain(|_, d| d.result.is_some() || d.commitment.expires_at > now);
        Ok(before - draws.len())
    }
}
