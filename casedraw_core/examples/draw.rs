use casedraw_core::{
    DrawService, EngineConfig, MemoryLedger, MemoryStore, TableRegistry, DrawTable, Verification,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Example end-to-end draw: commit, draw, reveal, verify
    let tables = TableRegistry::new(DrawTable::defaults()?);
    let ledger = MemoryLedger::with_balance("player", 500);
    let service = DrawService::new(EngineConfig::default(), tables, ledger, MemoryStore::new())?;

    let commitment = service.open_commitment("case_legendary").await?;
    println!("committed draw={} hash={}", commitment.draw_id, commitment.server_seed_hash);

    let receipt = service
        .submit_draw("player", commitment.draw_id, "example-client-seed", 500)
        .await?;
    let seed = service.reveal_seed(commitment.draw_id).await?;

    let table = service.tables().get("case_legendary").ok_or("table missing")?;
    let verdict = Verification::new(
        &seed,
        "example-client-seed",
        receipt.sequence,
        &table.weights,
        &receipt.outcome_id,
    )
    .with_commitment(&commitment.server_seed_hash)
    .with_table_fingerprint(&commitment.table_fingerprint)
    .run();
    println!(
        "outcome={} payout={} seed={} verdict={:?}",
        receipt.outcome_id, receipt.payout, seed, verdict
    );
    Ok(())
}
