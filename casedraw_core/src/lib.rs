pub mod commitment;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod rng;
pub mod service;
pub mod store;
pub mod tables;
pub mod verify;
pub mod weights;

pub use crate::commitment::{Clock, Commitment, CommitmentState, ManualClock, SystemClock};
pub use crate::engine::{select, select_from_roll, DrawEngine, DrawRequest, DrawResult, Selection, Wager};
pub use crate::error::{DrawError, TableError};
pub use crate::ledger::{EntryKind, Ledger, LedgerEntry, LedgerError, MemoryLedger, SettleError};
pub use crate::rng::{derive_hash_hex, derive_roll, ServerSeed, COMMITMENT_SCHEME};
pub use crate::service::{DrawReceipt, DrawService, EngineConfig};
pub use crate::store::{DrawStore, MemoryStore, StoreError, StoredDraw};
pub use crate::tables::{DrawTable, TableRegistry};
pub use crate::verify::{verify, InvalidReason, Verdict, Verification};
pub use crate::weights::{WeightEntry, WeightTable, MAX_TOTAL_WEIGHT};
