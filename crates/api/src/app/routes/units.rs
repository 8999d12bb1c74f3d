use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use fieldstock_assets::UnitId;
use fieldstock_infra::procurement::{UnitFilter, UnitStatusChange};

use crate::app::{dto, errors};
use crate::app::services::AppServices;
use crate::context::ActorContext;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_units))
        .route("/:id", get(get_unit))
        .route("/:id/status", post(change_status))
        .route("/:id/relocate", post(relocate))
}

pub async fn list_units(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::UnitsQuery>,
) -> axum::response::Response {
    let filter = UnitFilter {
        status: query.status,
        search: query.search,
        part_id: query.part_id,
        location_id: query.location_id,
    };
    let units: Vec<_> = services
        .procurement
        .list_units(&filter)
        .iter()
        .map(dto::unit_to_json)
        .collect();
    (StatusCode::OK, Json(units)).into_response()
}

pub async fn get_unit(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let unit_id: UnitId = match dto::parse_id(&id, "unit") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match services.procurement.get_unit(unit_id) {
        Ok(unit) => (StatusCode::OK, Json(dto::unit_to_json(&unit))).into_response(),
        Err(e) => errors::operation_error_to_response(e),
    }
}

pub async fn change_status(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(actor): Extension<ActorContext>,
    Path(id): Path<String>,
    Json(body): Json<UnitStatusChange>,
) -> axum::response::Response {
    let unit_id: UnitId = match dto::parse_id(&id, "unit") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match services
        .procurement
        .change_unit_status(unit_id, body, actor.user_id())
        .await
    {
        Ok(unit) => (StatusCode::OK, Json(dto::unit_to_json(&unit))).into_response(),
        Err(e) => errors::operation_error_to_response(e),
    }
}

pub async fn relocate(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(actor): Extension<ActorContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::RelocateUnitRequest>,
) -> axum::response::Response {
    let unit_id: UnitId = match dto::parse_id(&id, "unit") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match services
        .procurement
        .relocate_unit(unit_id, body.to, actor.user_id())
        .await
    {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(e) => errors::operation_error_to_response(e),
    }
}
