// Server-seed commitments: a fresh seed per draw, only its SHA-256 published
// until the draw has a stored result.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::engine::DrawResult;
use crate::error::DrawError;
use crate::rng::{ServerSeed, COMMITMENT_SCHEME};
use crate::store::{DrawStore, StoreError, StoredDraw};
use crate::tables::DrawTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitmentState {
    Open,
    Revealed,
    Expired,
}

/// Public half of a commitment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commitment {
    pub draw_id: Uuid,
    pub server_seed_hash: String,
    pub scheme: String,
    pub table_id: String,
    pub table_fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: CommitmentState,
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock(StdMutex<DateTime<Utc>>);

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self(StdMutex::new(start))
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.0.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Everything known about one draw. Guarded by its own async mutex; whoever
/// holds it owns the draw for the duration of open, finalize or reveal.
#[derive(Debug)]
pub struct DrawRecord {
    pub commitment: Commitment,
    pub table: Arc<DrawTable>,
    pub next_sequence: u64,
    pub result: Option<DrawResult>,
    server_seed: ServerSeed,
}

impl DrawRecord {
    /// Rehydrate a record from its durable copy.
    pub fn from_stored(stored: StoredDraw) -> Self {
        let mut commitment = stored.commitment;
        if stored.revealed_at.is_some() {
            commitment.state = CommitmentState::Revealed;
        }
        Self {
            commitment,
            table: Arc::new(stored.table),
            next_sequence: stored.next_sequence,
            result: stored.result,
            server_seed: stored.server_seed,
        }
    }

    fn to_stored(&self) -> StoredDraw {
        StoredDraw {
            commitment: self.commitment.clone(),
            server_seed: self.server_seed.clone(),
            table: (*self.table).clone(),
            next_sequence: self.next_sequence,
            result: self.result.clone(),
            revealed_at: None,
        }
    }

    pub fn server_seed(&self) -> &ServerSeed {
        &self.server_seed
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.commitment.state == CommitmentState::Expired
            || (self.commitment.state == CommitmentState::Open && now >= self.commitment.expires_at)
    }

    /// Flip an overdue open commitment to `Expired`. Returns whether it is expired.
    pub fn expire_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_expired(now) {
            self.commitment.state = CommitmentState::Expired;
            return true;
        }
        false
    }
}

pub type RecordHandle = Arc<Mutex<DrawRecord>>;

pub struct CommitmentManager {
    records: RwLock<HashMap<Uuid, RecordHandle>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl CommitmentManager {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            ttl,
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Generate a fresh server seed for a draw against `table` and persist it
    /// before anything is published. Only the hash leaves this function.
    pub async fn open<S: DrawStore>(&self, table: Arc<DrawTable>, store: &S) -> Result<Commitment, DrawError> {
        let seed = ServerSeed::generate();
        let created_at = self.clock.now();
        let commitment = Commitment {
            draw_id: Uuid::new_v4(),
            server_seed_hash: seed.hash_hex(),
            scheme: COMMITMENT_SCHEME.to_string(),
            table_id: table.id.clone(),
            table_fingerprint: table.weights.fingerprint(),
            created_at,
            expires_at: created_at + self.ttl,
            state: CommitmentState::Open,
        };
        let record = DrawRecord {
            commitment: commitment.clone(),
            table,
            next_sequence: 1,
            result: None,
            server_seed: seed,
        };
        store.open(&record.to_stored()).await?;
        self.cache(record);
        info!(
            draw_id = %commitment.draw_id,
            table_id = %commitment.table_id,
            hash = %commitment.server_seed_hash,
            "commitment opened"
        );
        Ok(commitment)
    }

    /// Insert `record` unless another task cached the same draw first; either
    /// way every caller ends up sharing one handle.
    fn cache(&self, record: DrawRecord) -> RecordHandle {
        self.records
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .entry(record.commitment.draw_id)
            .or_insert_with(|| Arc::new(Mutex::new(record)))
            .clone()
    }

    pub fn cached(&self, draw_id: &Uuid) -> Option<RecordHandle> {
        self.records
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(draw_id)
            .cloned()
    }

    /// Handle for `draw_id`, reloading it from `store` when it is not cached.
    pub async fn record<S: DrawStore>(&self, draw_id: &Uuid, store: &S) -> Result<RecordHandle, DrawError> {
        if let Some(handle) = self.cached(draw_id) {
            return Ok(handle);
        }
        let stored = store
            .load(*draw_id)
            .await?
            .ok_or(DrawError::NotFound { draw_id: *draw_id })?;
        debug!(draw_id = %draw_id, "draw record reloaded from store");
        Ok(self.cache(DrawRecord::from_stored(stored)))
    }

    /// Drop a draw from memory. Its durable copy stays in the store.
    pub fn evict(&self, draw_id: &Uuid) {
        self.records
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(draw_id);
    }

    pub async fn commitment<S: DrawStore>(&self, draw_id: &Uuid, store: &S) -> Result<Commitment, DrawError> {
        let handle = self.record(draw_id, store).await?;
        let commitment = handle.lock().await.commitment.clone();
        Ok(commitment)
    }

    /// Release the server seed of a finalized draw. The reveal is recorded in
    /// `store` before the state flips, so a failed write leaves the draw
    /// unrevealed and the call can be repeated. A revealed draw is dropped
    /// from memory.
    pub async fn reveal<S: DrawStore>(&self, draw_id: &Uuid, store: &S) -> Result<ServerSeed, DrawError> {
        let handle = self.record(draw_id, store).await?;
        let mut record = handle.lock().await;
        if record.commitment.state == CommitmentState::Revealed {
            return Err(DrawError::AlreadyRevealed { draw_id: *draw_id });
        }
        if record.result.is_none() {
            return Err(DrawError::DrawNotFinalized { draw_id: *draw_id });
        }
        match store.mark_revealed(*draw_id, self.clock.now()).await {
            Ok(()) => {}
            Err(StoreError::AlreadyRevealed(_)) => {
                record.commitment.state = CommitmentState::Revealed;
                return Err(DrawError::AlreadyRevealed { draw_id: *draw_id });
            }
            Err(e) => return Err(e.into()),
        }
        record.commitment.state = CommitmentState::Revealed;
        let seed = record.server_seed.clone();
        drop(record);
        self.evict(draw_id);
        info!(draw_id = %draw_id, "server seed revealed");
        Ok(seed)
    }

    /// Drop open commitments past their expiry together with their seeds,
    /// from memory and from `store`. Records currently locked by a finalize or
    /// reveal are left for the next sweep.
    pub async fn purge_expired<S: DrawStore>(&self, store: &S) -> Result<usize, DrawError> {
        let now = self.clock.now();
        let dropped = {
            let mut records = self.records.write().unwrap_or_else(|p| p.into_inner());
            let before = records.len();
            records.retain(|draw_id, handle| {
                let Ok(mut record) = handle.try_lock() else {
                    return true;
                };
                if record.result.is_none() && record.expire_if_due(now) {
                    debug!(draw_id = %draw_id, "dropping expired commitment");
                    return false;
                }
                true
            });
            before - records.len()
        };
        let deleted = store.purge_expired(now).await?;
        Ok(dropped.max(deleted))
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
