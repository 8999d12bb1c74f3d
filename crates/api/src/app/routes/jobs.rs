use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};

use fieldstock_core::JobId;

use crate::app::{dto, errors};
use crate::app::services::AppServices;
use crate::context::ActorContext;

pub fn router() -> Router {
    Router::new()
        .route("/:id/pick-list", get(pick_list))
        .route("/:id/pickup", post(pickup))
        .route("/:id/release", post(release))
        .route("/:id/technician", put(assign_technician))
}

fn parse_job_id(id: &str) -> Result<JobId, axum::response::Response> {
    dto::parse_id(id, "job")
}

pub async fn pick_list(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match services.procurement.pick_list(job_id) {
        Some(list) => (StatusCode::OK, Json(list)).into_response(),
        None => errors::json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("nothing staged for job {job_id}"),
        ),
    }
}

/// Move everything staged for the job onto the technician's vehicle (or `destination`).
pub async fn pickup(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(actor): Extension<ActorContext>,
    Path(id): Path<String>,
    body: Option<Json<dto::PickupRequest>>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let destination = body.map(|Json(b)| b).unwrap_or_default().destination;
    match services
        .procurement
        .pickup_parts_for_ticket(job_id, actor.user_id(), destination)
        .await
    {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(e) => errors::operation_error_to_response(e),
    }
}

pub async fn release(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(actor): Extension<ActorContext>,
    Path(id): Path<String>,
    body: Option<Json<dto::ReasonRequest>>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let reason = body.map(|Json(b)| b).unwrap_or_default().reason;
    match services
        .procurement
        .release_staged_items(job_id, reason, actor.user_id())
        .await
    {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(e) => errors::operation_error_to_response(e),
    }
}

pub async fn assign_technician(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(actor): Extension<ActorContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::JobTechnicianRequest>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match services
        .procurement
        .assign_job_technician(job_id, body.technician_id, actor.user_id())
        .await
    {
        Ok(staging) => (StatusCode::OK, Json(dto::staging_to_json(&staging))).into_response(),
        Err(e) => errors::operation_error_to_response(e),
    }
}

/// Jobs with staged parts still to collect, grouped by technician.
pub async fn pickups(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(actor): Extension<ActorContext>,
    Query(query): Query<dto::PickupsQuery>,
) -> axum::response::Response {
    let technician = if query.mine {
        Some(actor.user_id())
    } else {
        query.technician_id
    };
    let groups = services.procurement.parts_ready_for_pickup(technician);
    (StatusCode::OK, Json(groups)).into_response()
}
