use std::sync::Arc;

use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use fieldstock_infra::procurement::{NewMovement, TransferRequest};
use fieldstock_infra::projections::{MovementFilter, Pagination};

use crate::app::{dto, errors};
use crate::app::services::AppServices;
use crate::context::ActorContext;

pub fn router() -> Router {
    Router::new()
        .route("/movements", post(post_movement))
        .route("/quantity", get(quantity))
        .route("/levels", get(levels))
        .route("/history", get(history))
}

pub async fn post_movement(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(actor): Extension<ActorContext>,
    Json(body): Json<NewMovement>,
) -> axum::response::Response {
    match services.procurement.post_movement(body, actor.user_id()).await {
        Ok(posted) => (StatusCode::CREATED, Json(posted)).into_response(),
        Err(e) => errors::operation_error_to_response(e),
    }
}

pub async fn quantity(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::QuantityQuery>,
) -> axum::response::Response {
    let quantity = match query.job_id {
        Some(job_id) => services
            .procurement
            .reserved_at(query.part_id, query.location_id, job_id),
        None => services.procurement.quantity_at(query.part_id, query.location_id),
    };
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "part_id": query.part_id,
            "location_id": query.location_id,
            "job_id": query.job_id,
            "quantity": quantity,
        })),
    )
        .into_response()
}

pub async fn levels(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::LevelsQuery>,
) -> axum::response::Response {
    let levels = services
        .procurement
        .stock_levels(query.part_id, query.location_id);
    (StatusCode::OK, Json(levels)).into_response()
}

/// Ledger entries, most recent first. `limit` defaults to 50 and is capped at 1000.
pub async fn history(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::HistoryQuery>,
) -> axum::response::Response {
    let filter = MovementFilter {
        part_id: query.part_id,
        location_id: query.location_id,
        movement_type: query.movement_type,
        job_id: query.job_id,
    };
    let page = services
        .procurement
        .movement_history(&filter, Pagination::new(query.limit, query.offset));
    (StatusCode::OK, Json(page)).into_response()
}

pub async fn transfer(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(actor): Extension<ActorContext>,
    Json(body): Json<TransferRequest>,
) -> axum::response::Response {
    match services.procurement.transfer(body, actor.user_id()).await {
        Ok(result) => (StatusCode::CREATED, Json(result)).into_response(),
        Err(e) => errors::operation_error_to_response(e),
    }
}
