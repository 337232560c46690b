use std::fmt::Display;

use casedraw_core::{
    Commitment, CommitmentState, DrawResult, DrawStore, DrawTable, EntryKind, Ledger, LedgerEntry,
    LedgerError, ServerSeed, SettleError, StoreError, StoredDraw,
};
use casedraw_shared::{DrawLogEntry, LastWin, StatsResponse};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{sqlite::SqlitePoolOptions, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

pub async fn connect(url: &str) -> anyhow::Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(url)
        .await?;
    Ok(pool)
}

pub async fn init_db(db: &SqlitePool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(db).await?;
    Ok(())
}

// fixed width, so stored timestamps compare correctly as text
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

fn to_i64(amount: u64) -> Result<i64, LedgerError> {
    i64::try_from(amount).map_err(|_| LedgerError::Unavailable(format!("amount {amount} out of range")))
}

fn unavailable(e: sqlx::Error) -> LedgerError {
    LedgerError::Unavailable(e.to_string())
}

fn store_unavailable(e: impl Display) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn kind_str(kind: EntryKind) -> &'static str {
    match kind {
        EntryKind::Debit => "debit",
        EntryKind::Credit => "credit",
    }
}

/// Write the result row and spend its sequence. Fails with `Missing` when
/// the commitment is gone or already revealed.
async fn insert_draw(tx: &mut Transaction<'_, Sqlite>, r: &DrawResult) -> Result<(), StoreError> {
    let draw_id = r.draw_id.to_string();
    let res = sqlx::query(
        "UPDATE commitments SET next_sequence = MAX(next_sequence, ?) \
         WHERE draw_id = ? AND revealed_at IS NULL",
    )
    .bind(r.sequence.saturating_add(1) as i64)
    .bind(&draw_id)
    .execute(&mut **tx)
    .await
    .map_err(store_unavailable)?;
    if res.rows_affected() == 0 {
        return Err(StoreError::Missing(r.draw_id));
    }
    sqlx::query(
        "INSERT INTO draws (draw_id, ts, account_id, table_id, table_fingerprint, server_seed_hash, \
         client_seed, sequence, roll, point, outcome_id, derived_value, price, payout) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&draw_id)
    .bind(ts(r.finalized_at))
    .bind(&r.account_id)
    .bind(&r.table_id)
    .bind(&r.table_fingerprint)
    .bind(&r.server_seed_hash)
    .bind(&r.client_seed)
    .bind(r.sequence as i64)
    .bind(r.roll.to_string())
    .bind(r.point as i64)
    .bind(&r.outcome_id)
    .bind(r.derived_value)
    .bind(r.price as i64)
    .bind(r.payout as i64)
    .execute(&mut **tx)
    .await
    .map_err(|e| match e {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Duplicate(r.draw_id),
        other => store_unavailable(other),
    })?;
    Ok(())
}

/// Account balances in SQLite. Single movements run in their own
/// transaction; a draw settles in one transaction together with its result
/// row. Every movement leaves a row in `ledger_entries`.
#[derive(Clone)]
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn insert_entry(
        tx: &mut Transaction<'_, Sqlite>,
        account_id: &str,
        kind: &str,
        amount: i64,
        draw_id: Option<Uuid>,
        reverses: Option<i64>,
    ) -> Result<u64, LedgerError> {
        let res = sqlx::query(
            "INSERT INTO ledger_entries (ts, account_id, kind, amount, draw_id, reverses) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(ts(Utc::now()))
        .bind(account_id)
        .bind(kind)
        .bind(amount)
        .bind(draw_id.map(|id| id.to_string()))
        .bind(reverses)
        .execute(&mut **tx)
        .await
        .map_err(unavailable)?;
        Ok(res.last_insert_rowid() as u64)
    }

    async fn withdraw(
        tx: &mut Transaction<'_, Sqlite>,
        account_id: &str,
        amount: i64,
    ) -> Result<bool, LedgerError> {
        let res = sqlx::query(
            "UPDATE accounts SET balance = balance - ? WHERE account_id = ? AND balance >= ?",
        )
        .bind(amount)
        .bind(account_id)
        .bind(amount)
        .execute(&mut **tx)
        .await
        .map_err(unavailable)?;
        Ok(res.rows_affected() == 1)
    }

    async fn deposit(
        tx: &mut Transaction<'_, Sqlite>,
        account_id: &str,
        amount: i64,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO accounts (account_id, balance) VALUES (?, ?) \
             ON CONFLICT(account_id) DO UPDATE SET balance = balance + excluded.balance",
        )
        .bind(account_id)
        .bind(amount)
        .execute(&mut **tx)
        .await
        .map_err(unavailable)?;
        Ok(())
    }

    /// The error for a withdrawal that found too little on the account.
    async fn shortfall(tx: &mut Transaction<'_, Sqlite>, account_id: &str, needed: u64) -> LedgerError {
        let available: Result<Option<i64>, _> =
            sqlx::query_scalar("SELECT balance FROM accounts WHERE account_id = ?")
                .bind(account_id)
                .fetch_optional(&mut **tx)
                .await;
        match available {
            Ok(available) => LedgerError::InsufficientBalance {
                account_id: account_id.to_string(),
                available: available.unwrap_or(0).max(0) as u64,
                needed,
            },
            Err(e) => unavailable(e),
        }
    }
}

impl Ledger for SqliteLedger {
    async fn debit(&self, account_id: &str, amount: u64) -> Result<LedgerEntry, LedgerError> {
        let value = to_i64(amount)?;
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        if !Self::withdraw(&mut tx, account_id, value).await? {
            return Err(Self::shortfall(&mut tx, account_id, amount).await);
        }
        let id = Self::insert_entry(&mut tx, account_id, kind_str(EntryKind::Debit), value, None, None).await?;
        tx.commit().await.map_err(unavailable)?;
        Ok(LedgerEntry {
            id,
            account_id: account_id.to_string(),
            kind: EntryKind::Debit,
            amount,
        })
    }

    async fn credit(&self, account_id: &str, amount: u64) -> Result<LedgerEntry, LedgerError> {
        let value = to_i64(amount)?;
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        Self::deposit(&mut tx, account_id, value).await?;
        let id = Self::insert_entry(&mut tx, account_id, kind_str(EntryKind::Credit), value, None, None).await?;
        tx.commit().await.map_err(unavailable)?;
        Ok(LedgerEntry {
            id,
            account_id: account_id.to_string(),
            kind: EntryKind::Credit,
            amount,
        })
    }

    async fn reverse(&self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        let value = to_i64(entry.amount)?;
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        match entry.kind {
            EntryKind::Debit => Self::deposit(&mut tx, &entry.account_id, value).await?,
            EntryKind::Credit => {
                if !Self::withdraw(&mut tx, &entry.account_id, value).await? {
                    return Err(LedgerError::Unavailable(format!(
                        "cannot reverse credit {} on {}",
                        entry.id, entry.account_id
                    )));
                }
            }
        }
        Self::insert_entry(&mut tx, &entry.account_id, "reversal", value, None, Some(entry.id as i64)).await?;
        tx.commit().await.map_err(unavailable)?;
        Ok(())
    }

    async fn balance(&self, account_id: &str) -> Result<u64, LedgerError> {
        let balance: Option<i64> =
            sqlx::query_scalar("SELECT balance FROM accounts WHERE account_id = ?")
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(unavailable)?;
        Ok(balance.unwrap_or(0).max(0) as u64)
    }

    /// Debit, credit and the `draws` row commit together or not at all. The
    /// result row goes straight into this pool's database, which is where
    /// `SqliteStore` keeps it too.
    async fn settle<S: DrawStore>(&self, r: &DrawResult, _store: &S) -> Result<(), SettleError> {
        let price = to_i64(r.price).map_err(SettleError::before_debit)?;
        let payout = to_i64(r.payout).map_err(SettleError::before_debit)?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SettleError::before_debit(unavailable(e)))?;
        if !Self::withdraw(&mut tx, &r.account_id, price)
            .await
            .map_err(SettleError::before_debit)?
        {
            let err = Self::shortfall(&mut tx, &r.account_id, r.price).await;
            return Err(SettleError::before_debit(err));
        }
        // any early return from here drops `tx`, which rolls the debit back
        Self::insert_entry(&mut tx, &r.account_id, kind_str(EntryKind::Debit), price, Some(r.draw_id), None)
            .await
            .map_err(SettleError::after_debit)?;
        Self::deposit(&mut tx, &r.account_id, payout)
            .await
            .map_err(SettleError::after_debit)?;
        Self::insert_entry(&mut tx, &r.account_id, kind_str(EntryKind::Credit), payout, Some(r.draw_id), None)
            .await
            .map_err(SettleError::after_debit)?;
        insert_draw(&mut tx, r).await.map_err(SettleError::after_debit)?;
        tx.commit()
            .await
            .map_err(|e| SettleError::after_debit(unavailable(e)))?;
        Ok(())
    }
}

/// Commitments and draw results in the `commitments` and `draws` tables.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CommitmentRow {
    draw_id: String,
    server_seed: String,
    server_seed_hash: String,
    scheme: String,
    table_id: String,
    table_fingerprint: String,
    table_json: String,
    created_at: String,
    expires_at: String,
    next_sequence: i64,
    revealed_at: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct ResultRow {
    ts: String,
    account_id: String,
    table_id: String,
    table_fingerprint: String,
    server_seed_hash: String,
    client_seed: String,
    sequence: i64,
    roll: String,
    point: i64,
    outcome_id: String,
    derived_value: f64,
    price: i64,
    payout: i64,
}

impl CommitmentRow {
    fn into_stored(self, result: Option<ResultRow>) -> anyhow::Result<StoredDraw> {
        let draw_id: Uuid = self.draw_id.parse()?;
        let table: DrawTable = serde_json::from_str(&self.table_json)?;
        let revealed_at = self.revealed_at.as_deref().map(parse_ts).transpose()?;
        let result = match result {
            Some(row) => Some(DrawResult {
                draw_id,
                table_id: row.table_id,
                table_fingerprint: row.table_fingerprint,
                outcome_id: row.outcome_id,
                server_seed: self.server_seed.clone(),
                server_seed_hash: row.server_seed_hash,
                client_seed: row.client_seed,
                sequence: row.sequence as u64,
                roll: row.roll.parse()?,
                point: row.point as u64,
                derived_value: row.derived_value,
                account_id: row.account_id,
                price: row.price as u64,
                payout: row.payout as u64,
                finalized_at: parse_ts(&row.ts)?,
            }),
            None => None,
        };
        Ok(StoredDraw {
            commitment: Commitment {
                draw_id,
                server_seed_hash: self.server_seed_hash,
                scheme: self.scheme,
                table_id: self.table_id,
                table_fingerprint: self.table_fingerprint,
                created_at: parse_ts(&self.created_at)?,
                expires_at: parse_ts(&self.expires_at)?,
                state: if revealed_at.is_some() {
                    CommitmentState::Revealed
                } else {
                    CommitmentState::Open
                },
            },
            server_seed: ServerSeed::restore(self.server_seed),
            table,
            next_sequence: self.next_sequence.max(1) as u64,
            result,
            revealed_at,
        })
    }
}

impl DrawStore for SqliteStore {
    async fn open(&self, draw: &StoredDraw) -> Result<(), StoreError> {
        let c = &draw.commitment;
        let table_json = serde_json::to_string(&draw.table).map_err(store_unavailable)?;
        sqlx::query(
            "INSERT INTO commitments (draw_id, server_seed, server_seed_hash, scheme, table_id, \
             table_fingerprint, table_json, created_at, expires_at, next_sequence) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(c.draw_id.to_string())
        .bind(draw.server_seed.expose())
        .bind(&c.server_seed_hash)
        .bind(&c.scheme)
        .bind(&c.table_id)
        .bind(&c.table_fingerprint)
        .bind(table_json)
        .bind(ts(c.created_at))
        .bind(ts(c.expires_at))
        .bind(draw.next_sequence as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Duplicate(c.draw_id),
            other => store_unavailable(other),
        })?;
        Ok(())
    }

    async fn load(&self, draw_id: Uuid) -> Result<Option<StoredDraw>, StoreError> {
        let id = draw_id.to_string();
        let Some(row) = sqlx::query_as::<_, CommitmentRow>(
            "SELECT draw_id, server_seed, server_seed_hash, scheme, table_id, table_fingerprint, \
             table_json, created_at, expires_at, next_sequence, revealed_at \
             FROM commitments WHERE draw_id = ?",
        )
        .bind(&id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_unavailable)?
        else {
            return Ok(None);
        };
        let result = sqlx::query_as::<_, ResultRow>(
            "SELECT ts, account_id, table_id, table_fingerprint, server_seed_hash, client_seed, \
             sequence, roll, point, outcome_id, derived_value, price, payout \
             FROM draws WHERE draw_id = ?",
        )
        .bind(&id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_unavailable)?;
        row.into_stored(result).map(Some).map_err(store_unavailable)
    }

    async fn record(&self, r: &DrawResult) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_unavailable)?;
        insert_draw(&mut tx, r).await?;
        tx.commit().await.map_err(store_unavailable)?;
        Ok(())
    }

    async fn consume_sequence(&self, draw_id: Uuid, next_sequence: u64) -> Result<(), StoreError> {
        let res = sqlx::query(
            "UPDATE commitments SET next_sequence = MAX(next_sequence, ?) WHERE draw_id = ?",
        )
        .bind(next_sequence as i64)
        .bind(draw_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(store_unavailable)?;
        if res.rows_affected() == 0 {
            return Err(StoreError::Missing(draw_id));
        }
        Ok(())
    }

    async fn mark_revealed(&self, draw_id: Uuid, revealed_at: DateTime<Utc>) -> Result<(), StoreError> {
        let id = draw_id.to_string();
        let res = sqlx::query(
            "UPDATE commitments SET revealed_at = ? WHERE draw_id = ? AND revealed_at IS NULL \
             AND EXISTS (SELECT 1 FROM draws d WHERE d.draw_id = commitments.draw_id)",
        )
        .bind(ts(revealed_at))
        .bind(&id)
        .execute(&self.pool)
        .await
        .map_err(store_unavailable)?;
        if res.rows_affected() == 1 {
            return Ok(());
        }
        let revealed: Option<Option<String>> =
            sqlx::query_scalar("SELECT revealed_at FROM commitments WHERE draw_id = ?")
                .bind(&id)
                .fetch_optional(&self.pool)
                .await
                .map_err(store_unavailable)?;
        match revealed {
            Some(Some(_)) => Err(StoreError::AlreadyRevealed(draw_id)),
            _ => Err(StoreError::Missing(draw_id)),
        }
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let res = sqlx::query(
            "DELETE FROM commitments WHERE expires_at <= ? AND revealed_at IS NULL \
             AND NOT EXISTS (SELECT 1 FROM draws d WHERE d.draw_id = commitments.draw_id)",
        )
        .bind(ts(now))
        .execute(&self.pool)
        .await
        .map_err(store_unavailable)?;
        Ok(res.rows_affected() as usize)
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct DrawRow {
    pub draw_id: String,
    pub ts: String,
    pub account_id: String,
    pub table_id: String,
    pub table_fingerprint: String,
    pub server_seed_hash: String,
    pub server_seed: String,
    pub client_seed: String,
    pub sequence: i64,
    pub roll: String,
    pub outcome_id: String,
    pub derived_value: f64,
    pub price: i64,
    pub payout: i64,
    pub revealed_at: Option<String>,
}

impl DrawRow {
    /// Audit view; the seed is withheld until the draw is revealed.
    pub fn into_entry(self) -> anyhow::Result<DrawLogEntry> {
        Ok(DrawLogEntry {
            draw_id: self.draw_id.parse()?,
            ts: parse_ts(&self.ts)?,
            account_id: self.account_id,
            table_id: self.table_id,
            table_fingerprint: self.table_fingerprint,
            server_seed_hash: self.server_seed_hash,
            server_seed: self.revealed_at.map(|_| self.server_seed),
            client_seed: self.client_seed,
            sequence: self.sequence as u64,
            roll: self.roll.parse()?,
            outcome_id: self.outcome_id,
            derived_value: self.derived_value,
            price: self.price as u64,
            payout: self.payout as u64,
        })
    }
}

const DRAW_SELECT: &str = "SELECT d.draw_id, d.ts, d.account_id, d.table_id, d.table_fingerprint, \
    d.server_seed_hash, c.server_seed, d.client_seed, d.sequence, d.roll, d.outcome_id, \
    d.derived_value, d.price, d.payout, c.revealed_at \
    FROM draws d JOIN commitments c ON c.draw_id = d.draw_id";

pub async fn get_draw(pool: &SqlitePool, draw_id: Uuid) -> anyhow::Result<Option<DrawLogEntry>> {
    let row = sqlx::query_as::<_, DrawRow>(&format!("{DRAW_SELECT} WHERE d.draw_id = ?"))
        .bind(draw_id.to_string())
        .fetch_optional(pool)
        .await?;
    row.map(DrawRow::into_entry).transpose()
}

pub async fn recent_draws(pool: &SqlitePool, n: i64) -> anyhow::Result<Vec<DrawLogEntry>> {
    let rows = sqlx::query_as::<_, DrawRow>(&format!("{DRAW_SELECT} ORDER BY d.rowid DESC LIMIT ?"))
        .bind(n)
        .fetch_all(pool)
        .await?;
    rows.into_iter().map(DrawRow::into_entry).collect()
}

pub async fn account_stats(pool: &SqlitePool, ledger: &SqliteLedger, account_id: &str) -> anyhow::Result<StatsResponse> {
    let (spins, won): (i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), COALESCE(SUM(payout), 0) FROM draws WHERE account_id = ?",
    )
    .bind(account_id)
    .fetch_one(pool)
    .await?;
    let last: Option<(String, String)> = sqlx::query_as(
        "SELECT outcome_id, ts FROM draws WHERE account_id = ? ORDER BY rowid DESC LIMIT 1",
    )
    .bind(account_id)
    .fetch_optional(pool)
    .await?;
    let last_win = match last {
        Some((outcome_id, ts)) => Some(LastWin {
            outcome_id,
            ts: parse_ts(&ts)?,
        }),
        None => None,
    };
    Ok(StatsResponse {
        account_id: account_id.to_string(),
        balance: ledger.balance(account_id).await?,
        total_spins: spins as u64,
        total_won: won as u64,
        last_win,
    })
}
