use std::sync::Arc;

use casedraw_core::{
    select, verify, DrawError, DrawRequest, DrawResult, DrawService, DrawStore, DrawTable,
    EngineConfig, InvalidReason, Ledger, LedgerEntry, LedgerError, ManualClock, MemoryLedger,
    MemoryStore, StoreError, StoredDraw, TableRegistry, Verdict, Verification, Wager, WeightTable,
};
use chrono::{DateTime, Duration, Utc};
use rand::{rngs::StdRng, Rng, SeedableRng};
use uuid::Uuid;

fn rarity_table() -> WeightTable {
    WeightTable::normalize([("common", 74), ("rare", 20), ("epic", 5), ("legendary", 1)]).unwrap()
}

fn service<L: Ledger, S: DrawStore>(ledger: L, store: S) -> DrawService<L, S> {
    DrawService::new(
        EngineConfig::default(),
        TableRegistry::new(DrawTable::defaults().unwrap()),
        ledger,
        store,
    )
    .unwrap()
}

/// Delegates to a memory ledger but refuses every credit.
struct CreditFails(MemoryLedger);

impl Ledger for CreditFails {
    async fn debit(&self, account_id: &str, amount: u64) -> Result<LedgerEntry, LedgerError> {
        self.0.debit(account_id, amount).await
    }

    async fn credit(&self, _account_id: &str, _amount: u64) -> Result<LedgerEntry, LedgerError> {
        Err(LedgerError::Unavailable("credit path down".into()))
    }

    async fn reverse(&self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        self.0.reverse(entry).await
    }

    async fn balance(&self, account_id: &str) -> Result<u64, LedgerError> {
        self.0.balance(account_id).await
    }
}

/// Keeps commitments in memory but cannot write results.
#[derive(Default)]
struct ResultsDown(MemoryStore);

impl DrawStore for ResultsDown {
    async fn open(&self, draw: &StoredDraw) -> Result<(), StoreError> {
        self.0.open(draw).await
    }

    async fn load(&self, draw_id: Uuid) -> Result<Option<StoredDraw>, StoreError> {
        self.0.load(draw_id).await
    }

    async fn record(&self, _result: &DrawResult) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("disk full".into()))
    }

    async fn consume_sequence(&self, draw_id: Uuid, next_sequence: u64) -> Result<(), StoreError> {
        self.0.consume_sequence(draw_id, next_sequence).await
    }

    async fn mark_revealed(&self, draw_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.0.mark_revealed(draw_id, at).await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        self.0.purge_expired(now).await
    }
}

#[test]
fn selection_repeatable() {
    let t = rarity_table();
    let first = select("s", "c", 42, &t).unwrap();
    for _ in 0..3 {
        assert_eq!(select("s", "c", 42, &t).unwrap(), first);
        assert_eq!(verify("s", "c", 42, &t, &first.outcome_id), Verdict::Valid);
    }
}

#[test]
fn distribution_matches_weights() {
    const DRAWS: usize = 100_000;
    let t = rarity_table();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut counts = [0u64; 4];
    for _ in 0..DRAWS {
        let server: [u8; 32] = rng.gen();
        let client: u64 = rng.gen();
        let s = select(&hex::encode(server), &client.to_string(), 1, &t).unwrap();
        counts[s.index] += 1;
    }
    let chi2: f64 = t
        .entries()
        .iter()
        .zip(counts)
        .map(|(e, observed)| {
            let expected = DRAWS as f64 * e.weight as f64 / t.total_weight() as f64;
            (observed as f64 - expected).powi(2) / expected
        })
        .sum();
    // 3 degrees of freedom; 16.27 is the p = 0.001 critical value
    assert!(chi2 < 20.0, "chi-squared {chi2} for counts {counts:?}");
}

#[test]
fn concrete_point_80_selects_b() {
    let t = WeightTable::normalize([("A", 74), ("B", 20), ("C", 5), ("D", 1)]).unwrap();
    let (client, sel) = (0..10_000)
        .map(|i| format!("client-{i}"))
        .find_map(|c| {
            let s = select("fixed-server-seed", &c, 7, &t).unwrap();
            (s.point == 80).then_some((c, s))
        })
        .expect("some client seed reduces to 80");
    assert_eq!(sel.outcome_id, "B");
    assert_eq!(verify("fixed-server-seed", &client, 7, &t, "B"), Verdict::Valid);
    for other in ["A", "C", "D"] {
        assert!(!verify("fixed-server-seed", &client, 7, &t, other).is_valid());
    }
}

#[tokio::test]
async fn reveal_only_after_finalize() {
    let svc = service(MemoryLedger::with_balance("alice", 50), MemoryStore::new());
    let c = svc.open_commitment("case_common").await.unwrap();

    assert!(matches!(
        svc.reveal_seed(c.draw_id).await,
        Err(DrawError::DrawNotFinalized { .. })
    ));
    assert!(svc.public_result(c.draw_id).await.unwrap().is_none());

    svc.submit_draw("alice", c.draw_id, "lucky", 50).await.unwrap();
    let (hidden, _) = svc.public_result(c.draw_id).await.unwrap().unwrap();
    assert!(hidden.server_seed.is_empty());

    let seed = svc.reveal_seed(c.draw_id).await.unwrap();
    assert_eq!(casedraw_core::derive_hash_hex(seed.as_bytes()), c.server_seed_hash);
    assert!(matches!(
        svc.reveal_seed(c.draw_id).await,
        Err(DrawError::AlreadyRevealed { .. })
    ));
    let (shown, _) = svc.public_result(c.draw_id).await.unwrap().unwrap();
    assert_eq!(shown.server_seed, seed);
    assert!(svc.store().get(&c.draw_id).unwrap().revealed_at.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_finalize_at_most_once() {
    let svc = Arc::new(service(MemoryLedger::with_balance("alice", 100), MemoryStore::new()));
    let draw_id = svc.open_commitment("case_common").await.unwrap().draw_id;

    let tasks: Vec<_> = (0..2)
        .map(|i| {
            let svc = svc.clone();
            tokio::spawn(async move {
                svc.submit_draw("alice", draw_id, &format!("seed-{i}"), 50).await
            })
        })
        .collect();
    let mut ok = 0;
    let mut refused = 0;
    for t in tasks {
        match t.await.unwrap() {
            Ok(_) => ok += 1,
            Err(DrawError::AlreadyFinalized { .. }) => refused += 1,
            Err(e) => panic!("unexpected error {e}"),
        }
    }
    assert_eq!((ok, refused), (1, 1));

    let stored = svc.store().get(&draw_id).unwrap().result.unwrap();
    assert_eq!(svc.ledger().balance("alice").await.unwrap(), 50 + stored.payout);
    assert_eq!(svc.store().results(), 1);
}

#[tokio::test]
async fn repeated_finalize_is_refused_without_charge() {
    let svc = service(MemoryLedger::with_balance("alice", 500), MemoryStore::new());
    let c = svc.open_commitment("case_common").await.unwrap();
    let request = DrawRequest {
        draw_id: c.draw_id,
        client_seed: "abc".into(),
        sequence: 1,
        table_id: "case_common".into(),
    };
    let wager = Wager {
        account_id: "alice".into(),
        price: 50,
    };
    let result = svc.finalize(request.clone(), &wager).await.unwrap();
    let balance = svc.ledger().balance("alice").await.unwrap();
    assert_eq!(balance, 450 + result.payout);

    assert!(matches!(
        svc.finalize(request, &wager).await,
        Err(DrawError::AlreadyFinalized { .. })
    ));
    assert_eq!(svc.ledger().balance("alice").await.unwrap(), balance);
}

#[tokio::test]
async fn tampering_is_detected() {
    let svc = service(MemoryLedger::with_balance("alice", 500), MemoryStore::new());
    let c = svc.open_commitment("case_legendary").await.unwrap();
    svc.submit_draw("alice", c.draw_id, "player-seed", 500).await.unwrap();
    svc.reveal_seed(c.draw_id).await.unwrap();
    let (result, _) = svc.public_result(c.draw_id).await.unwrap().unwrap();
    let table = svc.tables().get("case_legendary").unwrap();

    assert_eq!(Verification::of_result(&result, &table.weights).run(), Verdict::Valid);

    let mut flipped = result.server_seed.clone().into_bytes();
    flipped[0] ^= 1;
    let bad_seed = String::from_utf8(flipped).unwrap();
    let mut r = result.clone();
    r.server_seed = bad_seed;
    assert!(matches!(
        Verification::of_result(&r, &table.weights).run(),
        Verdict::Invalid(InvalidReason::CommitmentMismatch { .. })
    ));

    let mut r = result.clone();
    r.client_seed.push('!');
    assert!(!Verification::of_result(&r, &table.weights).run().is_valid());

    let mut r = result.clone();
    r.sequence += 1;
    assert!(!Verification::of_result(&r, &table.weights).run().is_valid());

    let mut reordered: Vec<(String, i64)> = table
        .weights
        .entries()
        .iter()
        .map(|e| (e.outcome_id.clone(), e.weight as i64))
        .collect();
    reordered.swap(0, 1);
    let reordered = WeightTable::normalize(reordered).unwrap();
    assert!(matches!(
        Verification::of_result(&result, &reordered).run(),
        Verdict::Invalid(InvalidReason::TableMismatch { .. })
    ));

    let reweighted = WeightTable::normalize(
        table
            .weights
            .entries()
            .iter()
            .map(|e| (e.outcome_id.clone(), e.weight as i64 + 1)),
    )
    .unwrap();
    assert!(matches!(
        Verification::of_result(&result, &reweighted).run(),
        Verdict::Invalid(InvalidReason::TableMismatch { .. })
    ));
}

#[tokio::test]
async fn ledger_settles_debit_then_credit() {
    let svc = service(MemoryLedger::with_balance("alice", 50), MemoryStore::new());
    let c = svc.open_commitment("case_common").await.unwrap();
    let receipt = svc.submit_draw("alice", c.draw_id, "seed", 50).await.unwrap();
    assert_eq!(svc.ledger().balance("alice").await.unwrap(), receipt.payout);
    assert_eq!(receipt.sequence, 1);
}

#[tokio::test]
async fn failed_credit_rolls_back_everything() {
    let svc = service(CreditFails(MemoryLedger::with_balance("alice", 50)), MemoryStore::new());
    let c = svc.open_commitment("case_common").await.unwrap();

    let err = svc.submit_draw("alice", c.draw_id, "seed", 50).await.unwrap_err();
    assert!(matches!(err, DrawError::Ledger(LedgerError::Unavailable(_))));
    assert_eq!(svc.ledger().balance("alice").await.unwrap(), 50);
    assert_eq!(svc.store().results(), 0);
    assert!(svc.public_result(c.draw_id).await.unwrap().is_none());
    assert!(matches!(
        svc.reveal_seed(c.draw_id).await,
        Err(DrawError::DrawNotFinalized { .. })
    ));

    // the wager was taken before the failure, so the request stays spent
    assert_eq!(svc.store().get(&c.draw_id).unwrap().next_sequence, 2);
    let replay = DrawRequest {
        draw_id: c.draw_id,
        client_seed: "seed".into(),
        sequence: 1,
        table_id: "case_common".into(),
    };
    let wager = Wager {
        account_id: "alice".into(),
        price: 50,
    };
    assert!(matches!(
        svc.finalize(replay, &wager).await,
        Err(DrawError::SequenceReplay { sequence: 1, next: 2, .. })
    ));
}

#[tokio::test]
async fn failed_store_write_rolls_back_ledger() {
    let svc = service(MemoryLedger::with_balance("alice", 50), ResultsDown::default());
    let c = svc.open_commitment("case_common").await.unwrap();
    let err = svc.submit_draw("alice", c.draw_id, "seed", 50).await.unwrap_err();
    assert!(matches!(err, DrawError::Store(StoreError::Unavailable(_))));
    assert_eq!(svc.ledger().balance("alice").await.unwrap(), 50);
    assert!(svc.public_result(c.draw_id).await.unwrap().is_none());
}

#[tokio::test]
async fn insufficient_balance_changes_nothing() {
    let svc = service(MemoryLedger::with_balance("bob", 49), MemoryStore::new());
    let c = svc.open_commitment("case_common").await.unwrap();
    let err = svc.submit_draw("bob", c.draw_id, "seed", 50).await.unwrap_err();
    assert!(matches!(err, DrawError::InsufficientBalance));
    assert_eq!(svc.ledger().balance("bob").await.unwrap(), 49);
    assert_eq!(svc.store().results(), 0);
    assert_eq!(svc.store().get(&c.draw_id).unwrap().next_sequence, 1);

    // nothing was taken, so the retry draws with the same sequence
    svc.ledger().set_balance("bob", 50);
    let receipt = svc.submit_draw("bob", c.draw_id, "seed", 50).await.unwrap();
    assert_eq!(receipt.sequence, 1);
}

#[tokio::test]
async fn wrong_price_and_unknown_table_refused() {
    let svc = service(MemoryLedger::with_balance("bob", 500), MemoryStore::new());
    assert!(matches!(
        svc.open_commitment("no_such_case").await,
        Err(DrawError::UnknownTable { .. })
    ));
    let c = svc.open_commitment("case_rare").await.unwrap();
    assert!(matches!(
        svc.submit_draw("bob", c.draw_id, "seed", 1).await,
        Err(DrawError::PriceMismatch { offered: 1, expected: 150 })
    ));
    assert_eq!(svc.ledger().balance("bob").await.unwrap(), 500);
}

#[tokio::test]
async fn expired_commitment_cannot_be_consumed() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let svc = DrawService::with_clock(
        EngineConfig {
            commitment_ttl: Duration::seconds(60),
        },
        TableRegistry::new(DrawTable::defaults().unwrap()),
        MemoryLedger::with_balance("alice", 50),
        MemoryStore::new(),
        clock.clone(),
    )
    .unwrap();
    let c = svc.open_commitment("case_common").await.unwrap();
    clock.advance(Duration::seconds(61));

    assert!(matches!(
        svc.submit_draw("alice", c.draw_id, "late", 50).await,
        Err(DrawError::CommitmentNotOpen { .. })
    ));
    assert_eq!(svc.ledger().balance("alice").await.unwrap(), 50);

    assert_eq!(svc.purge_expired().await.unwrap(), 1);
    assert_eq!(svc.open_draws(), 0);
    assert!(svc.store().is_empty());
    assert!(matches!(
        svc.submit_draw("alice", c.draw_id, "late", 50).await,
        Err(DrawError::NotFound { .. })
    ));
}

#[tokio::test]
async fn finished_draws_leave_memory() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let svc = DrawService::with_clock(
        EngineConfig::default(),
        TableRegistry::new(DrawTable::defaults().unwrap()),
        MemoryLedger::with_balance("alice", 100 * 50),
        MemoryStore::new(),
        clock.clone(),
    )
    .unwrap();

    let mut ids = Vec::new();
    for i in 0..100 {
        let c = svc.open_commitment("case_common").await.unwrap();
        svc.submit_draw("alice", c.draw_id, &format!("seed-{i}"), 50).await.unwrap();
        ids.push(c.draw_id);
    }
    assert_eq!(svc.open_draws(), 0);

    // reveal goes through the stored copy once the record has left memory
    for id in &ids {
        let seed = svc.reveal_seed(*id).await.unwrap();
        let (result, _) = svc.public_result(*id).await.unwrap().unwrap();
        assert_eq!(result.server_seed, seed);
    }
    assert_eq!(svc.open_draws(), 0);
    assert!(matches!(
        svc.reveal_seed(ids[0]).await,
        Err(DrawError::AlreadyRevealed { .. })
    ));

    clock.advance(Duration::days(365));
    assert_eq!(svc.purge_expired().await.unwrap(), 0);
    assert_eq!(svc.open_draws(), 0);
    assert_eq!(svc.store().results(), 100);
}
