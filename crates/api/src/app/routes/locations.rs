use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use fieldstock_catalog::{LocationId, StockLocation};
use fieldstock_core::UserId;
use fieldstock_infra::OperationResult;
use fieldstock_infra::procurement::NewLocation;

use crate::app::{dto, errors};
use crate::app::services::AppServices;
use crate::context::ActorContext;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_locations).post(create_location))
        .route("/vehicle-for/:technician_id", get(vehicle_for))
        .route("/:id", get(get_location))
        .route("/:id/assign", post(assign_technician))
        .route("/:id/unassign", post(unassign_technician))
        .route("/:id/deactivate", post(deactivate_location))
        .route("/:id/reactivate", post(reactivate_location))
}

fn location_response(result: OperationResult<StockLocation>, status: StatusCode) -> axum::response::Response {
    match result {
        Ok(location) => (status, Json(dto::location_to_json(&location))).into_response(),
        Err(e) => errors::operation_error_to_response(e),
    }
}

pub async fn create_location(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(actor): Extension<ActorContext>,
    Json(body): Json<NewLocation>,
) -> axum::response::Response {
    let result = services.procurement.create_location(body, actor.user_id()).await;
    location_response(result, StatusCode::CREATED)
}

pub async fn list_locations(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListLocationsQuery>,
) -> axum::response::Response {
    let locations: Vec<_> = services
        .procurement
        .list_locations(query.location_type)
        .iter()
        .map(dto::location_to_json)
        .collect();
    (StatusCode::OK, Json(locations)).into_response()
}

pub async fn get_location(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let location_id: LocationId = match dto::parse_id(&id, "location") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    location_response(services.procurement.get_location(location_id), StatusCode::OK)
}

pub async fn vehicle_for(
    Extension(services): Extension<Arc<AppServices>>,
    Path(technician_id): Path<String>,
) -> axum::response::Response {
    let technician: UserId = match dto::parse_id(&technician_id, "technician") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match services.procurement.vehicle_for(technician) {
        Some(vehicle) => (StatusCode::OK, Json(dto::location_to_json(&vehicle))).into_response(),
        None => errors::json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("no vehicle assigned to technician {technician}"),
        ),
    }
}

pub async fn assign_technician(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(actor): Extension<ActorContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::AssignTechnicianRequest>,
) -> axum::response::Response {
    let location_id: LocationId = match dto::parse_id(&id, "location") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let result = services
        .procurement
        .assign_technician(location_id, body.technician_id, body.reassign, actor.user_id())
        .await;
    location_response(result, StatusCode::OK)
}

pub async fn unassign_technician(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(actor): Extension<ActorContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let location_id: LocationId = match dto::parse_id(&id, "location") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let result = services
        .procurement
        .unassign_technician(location_id, actor.user_id())
        .await;
    location_response(result, StatusCode::OK)
}

pub async fn deactivate_location(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(actor): Extension<ActorContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let location_id: LocationId = match dto::parse_id(&id, "location") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let result = services
        .procurement
        .deactivate_location(location_id, actor.user_id())
        .await;
    location_response(result, StatusCode::OK)
}

pub async fn reactivate_location(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(actor): Extension<ActorContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let location_id: LocationId = match dto::parse_id(&id, "location") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let result = services
        .procurement
        .reactivate_location(location_id, actor.user_id())
        .await;
    location_response(result, StatusCode::OK)
}
