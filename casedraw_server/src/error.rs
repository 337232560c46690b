use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use casedraw_core::{DrawError, TableError};
use casedraw_shared::ApiError;
use tracing::error;

/// Handler error: an [`ApiError`] that knows its HTTP status.
#[derive(Debug)]
pub struct AppError(pub ApiError);

impl AppError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            ApiError::Invalid(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Draw { kind, .. } => match *kind {
                "NotFound" | "UnknownTable" => StatusCode::NOT_FOUND,
                "InsufficientBalance" => StatusCode::PAYMENT_REQUIRED,
                "AlreadyRevealed" | "AlreadyFinalized" | "SequenceReplay" | "CommitmentNotOpen"
                | "DrawNotFinalized" => StatusCode::CONFLICT,
                "Ledger" | "Store" | "Digest" => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::UNPROCESSABLE_ENTITY,
            },
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.0.body())).into_response()
    }
}

impl From<ApiError> for AppError {
    fn from(err: ApiError) -> Self {
        Self(err)
    }
}

impl From<DrawError> for AppError {
    fn from(err: DrawError) -> Self {
        Self(ApiError::Draw {
            kind: err.kind(),
            message: err.to_string(),
        })
    }
}

impl From<TableError> for AppError {
    fn from(err: TableError) -> Self {
        DrawError::from(err).into()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        error!(error = %err, "request failed");
        Self(ApiError::Internal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn draw_errors_map_to_statuses() {
        let id = Uuid::new_v4();
        let cases = [
            (DrawError::AlreadyFinalized { draw_id: id }, StatusCode::CONFLICT),
            (DrawError::NotFound { draw_id: id }, StatusCode::NOT_FOUND),
            (DrawError::InsufficientBalance, StatusCode::PAYMENT_REQUIRED),
            (
                DrawError::PriceMismatch { offered: 1, expected: 2 },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (DrawError::Table(TableError::EmptyTable), StatusCode::UNPROCESSABLE_ENTITY),
        ];
        for (err, status) in cases {
            let kind = err.kind();
            let app = AppError::from(err);
            assert_eq!(app.status(), status, "{kind}");
            assert_eq!(app.0.body().kind, kind);
        }
    }
}
