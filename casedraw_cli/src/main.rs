use std::path::{Path, PathBuf};

use chrono::Utc;
use clap::{Parser, Subcommand};
use sqlx::{sqlite::SqlitePoolOptions, Row, SqlitePool};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use casedraw_core::{derive_hash_hex, derive_roll, Verdict, Verification, WeightTable};

#[derive(Parser)]
#[command(name = "casedraw-cli", about = "Admin and audit CLI for the casedraw server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Database URL, default sqlite://casedraw.db
    #[arg(long, value_parser, env = "DATABASE_URL")]
    database_url: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Recompute a draw offline from its revealed inputs
    Verify {
        server_seed: String,
        client_seed: String,
        sequence: u64,
        /// JSON file with the table snapshot (`{"entries": [...]}`)
        table: PathBuf,
        outcome: String,
        #[arg(long)]
        commitment_hash: Option<String>,
        #[arg(long)]
        fingerprint: Option<String>,
        #[arg(long)]
        roll: Option<u64>,
    },
    /// Recheck seed hash and roll of every revealed draw in the database
    Audit,
    /// View last N draws
    ViewDraws {
        #[arg(default_value_t = 20)]
        n: i64,
    },
    /// Export draws to CSV path
    ExportCsv { path: String },
    /// Credit tokens to an account
    Grant { account: String, amount: i64 },
    /// Show an account balance
    Balance { account: String },
}

async fn get_pool(url: Option<String>) -> anyhow::Result<SqlitePool> {
    let url = url.unwrap_or_else(|| "sqlite://casedraw.db".into());
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await?;
    Ok(pool)
}

#[allow(clippy::too_many_arguments)]
fn verify_offline(
    server_seed: &str,
    client_seed: &str,
    sequence: u64,
    table: &Path,
    outcome: &str,
    commitment_hash: Option<&str>,
    fingerprint: Option<&str>,
    roll: Option<u64>,
) -> anyhow::Result<Verdict> {
    let raw = std::fs::read_to_string(table)?;
    let table: WeightTable = serde_json::from_str(&raw)?;
    let mut check = Verification::new(server_seed, client_seed, sequence, &table, outcome);
    if let Some(h) = commitment_hash {
        check = check.with_commitment(h);
    }
    if let Some(fp) = fingerprint {
        check = check.with_table_fingerprint(fp);
    }
    if let Some(r) = roll {
        check = check.with_roll(r);
    }
    Ok(check.run())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Verify {
            server_seed,
            client_seed,
            sequence,
            table,
            outcome,
            commitment_hash,
            fingerprint,
            roll,
        } => {
            let verdict = verify_offline(
                &server_seed,
                &client_seed,
                sequence,
                &table,
                &outcome,
                commitment_hash.as_deref(),
                fingerprint.as_deref(),
                roll,
            )?;
            match verdict {
                Verdict::Valid => println!("VALID: {} drawn at sequence {}", outcome, sequence),
                Verdict::Invalid(reason) => {
                    println!("INVALID: {}", reason);
                    std::process::exit(1);
                }
            }
        }
        Commands::Audit => {
            let pool = get_pool(cli.database_url).await?;
            let rows = sqlx::query("SELECT d.draw_id, c.server_seed, d.server_seed_hash, d.client_seed, d.sequence, d.roll \
                 FROM draws d JOIN commitments c ON c.draw_id = d.draw_id \
                 WHERE c.revealed_at IS NOT NULL ORDER BY d.rowid ASC")
                .fetch_all(&pool).await?;
            let mut bad = 0usize;
            for r in &rows {
                let draw_id: String = r.get("draw_id");
                let seed: String = r.get("server_seed");
                let hash: String = r.get("server_seed_hash");
                let client_seed: String = r.get("client_seed");
                let sequence: i64 = r.get("sequence");
                let roll: u64 = r.get::<String, _>("roll").parse()?;
                if derive_hash_hex(seed.as_bytes()) != hash {
                    warn!(draw_id = %draw_id, "seed does not match commitment");
                    bad += 1;
                } else if derive_roll(&seed, &client_seed, sequence as u64)? != roll {
                    warn!(draw_id = %draw_id, "stored roll does not match inputs");
                    bad += 1;
                }
            }
            println!("Audited {} revealed draws, {} mismatches", rows.len(), bad);
            if bad > 0 {
                std::process::exit(1);
            }
        }
        Commands::ViewDraws { n } => {
            let pool = get_pool(cli.database_url).await?;
            let rows = sqlx::query("SELECT d.draw_id, d.ts, d.account_id, d.table_id, d.sequence, d.outcome_id, d.payout, c.revealed_at \
                 FROM draws d JOIN commitments c ON c.draw_id = d.draw_id ORDER BY d.rowid DESC LIMIT ?")
                .bind(n)
                .fetch_all(&pool).await?;
            for r in rows {
                let draw_id: String = r.get("draw_id");
                let ts: String = r.get("ts");
                let account: String = r.get("account_id");
                let table_id: String = r.get("table_id");
                let sequence: i64 = r.get("sequence");
                let outcome: String = r.get("outcome_id");
                let payout: i64 = r.get("payout");
                let revealed: Option<String> = r.get("revealed_at");
                println!(
                    "{} {} account={} table={} seq={} outcome={} payout={} revealed={}",
                    draw_id,
                    ts,
                    account,
                    table_id,
                    sequence,
                    outcome,
                    payout,
                    revealed.is_some()
                );
            }
        }
        Commands::ExportCsv { path } => {
            let pool = get_pool(cli.database_url).await?;
            let mut wtr = csv::Writer::from_path(&path)?;
            wtr.write_record([
                "draw_id",
                "ts",
                "account_id",
                "table_id",
                "table_fingerprint",
                "server_seed_hash",
                "server_seed",
                "client_seed",
                "sequence",
                "roll",
                "outcome_id",
                "price",
                "payout",
            ])?;
            let rows = sqlx::query("SELECT d.draw_id, d.ts, d.account_id, d.table_id, d.table_fingerprint, d.server_seed_hash, c.server_seed, \
                 d.client_seed, d.sequence, d.roll, d.outcome_id, d.price, d.payout, c.revealed_at \
                 FROM draws d JOIN commitments c ON c.draw_id = d.draw_id ORDER BY d.rowid ASC")
                .fetch_all(&pool).await?;
            let total = rows.len();
            for r in &rows {
                // unrevealed seeds stay out of exports
                let revealed: Option<String> = r.get("revealed_at");
                let seed = match revealed {
                    Some(_) => r.get::<String, _>("server_seed"),
                    None => String::new(),
                };
                wtr.write_record(&[
                    r.get::<String, _>("draw_id"),
                    r.get::<String, _>("ts"),
                    r.get::<String, _>("account_id"),
                    r.get::<String, _>("table_id"),
                    r.get::<String, _>("table_fingerprint"),
                    r.get::<String, _>("server_seed_hash"),
                    seed,
                    r.get::<String, _>("client_seed"),
                    r.get::<i64, _>("sequence").to_string(),
                    r.get::<String, _>("roll"),
                    r.get::<String, _>("outcome_id"),
                    r.get::<i64, _>("price").to_string(),
                    r.get::<i64, _>("payout").to_string(),
                ])?;
            }
            wtr.flush()?;
            println!("Exported {} rows to {}", total, path);
        }
        Commands::Grant { account, amount } => {
            anyhow::ensure!(amount > 0, "amount must be positive");
            let pool = get_pool(cli.database_url).await?;
            let mut tx = pool.begin().await?;
            sqlx::query(
                "INSERT INTO accounts (account_id, balance) VALUES (?, ?) \
                 ON CONFLICT(account_id) DO UPDATE SET balance = balance + excluded.balance",
            )
            .bind(&account)
            .bind(amount)
            .execute(&mut *tx)
            .await?;
            sqlx::query("INSERT INTO ledger_entries (ts, account_id, kind, amount) VALUES (?, ?, 'credit', ?)")
                .bind(Utc::now().to_rfc3339())
                .bind(&account)
                .bind(amount)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            info!(account = %account, amount, "granted");
            println!("Granted {} to {}", amount, account);
        }
        Commands::Balance { account } => {
            let pool = get_pool(cli.database_url).await?;
            let balance: Option<i64> =
                sqlx::query_scalar("SELECT balance FROM accounts WHERE account_id = ?")
                    .bind(&account)
                    .fetch_optional(&pool)
                    .await?;
            println!("{}: {}", account, balance.unwrap_or(0));
        }
    }

    Ok(())
}
