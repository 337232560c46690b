use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::Authorization;
use axum_extra::TypedHeader;
use casedraw_core::{DrawService, DrawTable, Ledger, Verdict, Verification, WeightTable};
use casedraw_shared::{
    AdminGrantRequest, AdminUpsertTableRequest, ApiError, BalanceResponse, CommitmentResponse,
    DrawLogEntry, OpenCommitmentRequest, RevealRequest, RevealResponse, StatsResponse,
    SubmitDrawRequest, SubmitDrawResponse, TableSnapshot, VerifyRequest, VerifyResponse,
    WeightEntry,
};
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use crate::config::table_from_request;
use crate::db::{self, SqliteLedger, SqliteStore};
use crate::error::AppError;

pub type Service = DrawService<SqliteLedger, SqliteStore>;

pub struct AppState {
    pub service: Service,
    pub db: SqlitePool,
    pub api_key: String,
}

type ApiJson<T> = Result<Json<T>, AppError>;

fn snapshot(table: &DrawTable) -> TableSnapshot {
    TableSnapshot {
        id: table.id.clone(),
        price: table.price,
        fingerprint: table.weights.fingerprint(),
        total_weight: table.weights.total_weight(),
        entries: table
            .weights
            .entries()
            .iter()
            .map(|e| WeightEntry {
                outcome_id: e.outcome_id.clone(),
                weight: e.weight as i64,
            })
            .collect(),
        payouts: table.payouts.clone(),
    }
}

fn authorize(state: &AppState, bearer: &Bearer) -> Result<(), AppError> {
    if bearer.token() != state.api_key {
        return Err(ApiError::Unauthorized.into());
    }
    Ok(())
}

pub async fn route_tables(State(state): State<Arc<AppState>>) -> Json<Vec<TableSnapshot>> {
    let tables = state.service.tables();
    Json(
        tables
            .ids()
            .iter()
            .filter_map(|id| tables.get(id))
            .map(|t| snapshot(&t))
            .collect(),
    )
}

pub async fn route_table(
    State(state): State<Arc<AppState>>,
    Path(table_id): Path<String>,
) -> ApiJson<TableSnapshot> {
    let table = state
        .service
        .tables()
        .get(&table_id)
        .ok_or_else(|| ApiError::NotFound(format!("table {table_id}")))?;
    Ok(Json(snapshot(&table)))
}

pub async fn route_commit(
    State(state): State<Arc<AppState>>,
    Json(req): Json<OpenCommitmentRequest>,
) -> ApiJson<CommitmentResponse> {
    let c = state.service.open_commitment(&req.table_id).await?;
    Ok(Json(CommitmentResponse {
        draw_id: c.draw_id,
        server_seed_hash: c.server_seed_hash,
        scheme: c.scheme,
        table_id: c.table_id,
        table_fingerprint: c.table_fingerprint,
        expires_at: c.expires_at,
    }))
}

pub async fn route_spin(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitDrawRequest>,
) -> ApiJson<SubmitDrawResponse> {
    if req.client_seed.is_empty() || req.account_id.is_empty() {
        return Err(ApiError::Invalid("account_id and client_seed are required".into()).into());
    }
    let receipt = state
        .service
        .submit_draw(&req.account_id, req.draw_id, &req.client_seed, req.price)
        .await?;
    Ok(Json(SubmitDrawResponse {
        draw_id: receipt.draw_id,
        outcome_id: receipt.outcome_id,
        sequence: receipt.sequence,
        payout: receipt.payout,
    }))
}

pub async fn route_reveal(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RevealRequest>,
) -> ApiJson<RevealResponse> {
    let server_seed = state.service.reveal_seed(req.draw_id).await?;
    Ok(Json(RevealResponse {
        draw_id: req.draw_id,
        server_seed,
    }))
}

/// Pure recomputation; touches no server state.
pub async fn route_verify(Json(req): Json<VerifyRequest>) -> ApiJson<VerifyResponse> {
    let table = WeightTable::normalize(req.entries.into_iter().map(|e| (e.outcome_id, e.weight)))?;
    let mut check = Verification::new(
        &req.server_seed,
        &req.client_seed,
        req.sequence,
        &table,
        &req.claimed_outcome_id,
    );
    if let Some(hash) = &req.commitment_hash {
        check = check.with_commitment(hash);
    }
    if let Some(fp) = &req.table_fingerprint {
        check = check.with_table_fingerprint(fp);
    }
    if let Some(roll) = req.roll {
        check = check.with_roll(roll);
    }
    Ok(Json(match check.run() {
        Verdict::Valid => VerifyResponse {
            valid: true,
            reason: None,
        },
        Verdict::Invalid(reason) => VerifyResponse {
            valid: false,
            reason: Some(reason.to_string()),
        },
    }))
}

pub async fn route_draw(
    State(state): State<Arc<AppState>>,
    Path(draw_id): Path<Uuid>,
) -> ApiJson<DrawLogEntry> {
    let entry = db::get_draw(&state.db, draw_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("draw {draw_id}")))?;
    Ok(Json(entry))
}

pub async fn route_stats(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
) -> ApiJson<StatsResponse> {
    let stats = db::account_stats(&state.db, state.service.ledger(), &account_id).await?;
    Ok(Json(stats))
}

pub async fn route_admin_upsert_table(
    State(state): State<Arc<AppState>>,
    TypedHeader(Authorization(bearer)): TypedHeader<Authorization<Bearer>>,
    Json(req): Json<AdminUpsertTableRequest>,
) -> Result<StatusCode, AppError> {
    authorize(&state, &bearer)?;
    let table = table_from_request(req)?;
    info!(table_id = %table.id, fingerprint = %table.weights.fingerprint(), "table upserted");
    state.service.tables().upsert(table);
    Ok(StatusCode::NO_CONTENT)
}

pub async fn route_admin_grant(
    State(state): State<Arc<AppState>>,
    TypedHeader(Authorization(bearer)): TypedHeader<Authorization<Bearer>>,
    Json(req): Json<AdminGrantRequest>,
) -> ApiJson<BalanceResponse> {
    authorize(&state, &bearer)?;
    let ledger = state.service.ledger();
    ledger
        .credit(&req.account_id, req.amount)
        .await
        .map_err(casedraw_core::DrawError::from)?;
    let balance = ledger
        .balance(&req.account_id)
        .await
        .map_err(casedraw_core::DrawError::from)?;
    info!(account = %req.account_id, amount = req.amount, balance, "tokens granted");
    Ok(Json(BalanceResponse {
        account_id: req.account_id,
        balance,
    }))
}
