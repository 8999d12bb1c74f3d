use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use fieldstock_catalog::PartId;
use fieldstock_infra::procurement::{NewPart, PartChanges};

use crate::app::{dto, errors};
use crate::app::services::AppServices;
use crate::context::ActorContext;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_parts).post(create_part))
        .route("/:id", get(get_part).patch(update_part))
        .route("/:id/serialized", post(set_serialized))
        .route("/:id/deactivate", post(deactivate_part))
}

pub async fn create_part(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(actor): Extension<ActorContext>,
    Json(body): Json<NewPart>,
) -> axum::response::Response {
    match services.procurement.create_part(body, actor.user_id()).await {
        Ok(part) => (StatusCode::CREATED, Json(dto::part_to_json(&part))).into_response(),
        Err(e) => errors::operation_error_to_response(e),
    }
}

pub async fn list_parts(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListPartsQuery>,
) -> axum::response::Response {
    let parts: Vec<_> = services
        .procurement
        .list_parts(query.include_inactive)
        .iter()
        .map(dto::part_to_json)
        .collect();
    (StatusCode::OK, Json(parts)).into_response()
}

pub async fn get_part(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let part_id: PartId = match dto::parse_id(&id, "part") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match services.procurement.get_part(part_id) {
        Ok(part) => (StatusCode::OK, Json(dto::part_to_json(&part))).into_response(),
        Err(e) => errors::operation_error_to_response(e),
    }
}

pub async fn update_part(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(actor): Extension<ActorContext>,
    Path(id): Path<String>,
    Json(body): Json<PartChanges>,
) -> axum::response::Response {
    let part_id: PartId = match dto::parse_id(&id, "part") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match services.procurement.update_part(part_id, body, actor.user_id()).await {
        Ok(part) => (StatusCode::OK, Json(dto::part_to_json(&part))).into_response(),
        Err(e) => errors::operation_error_to_response(e),
    }
}

pub async fn set_serialized(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(actor): Extension<ActorContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::SetSerializedRequest>,
) -> axum::response::Response {
    let part_id: PartId = match dto::parse_id(&id, "part") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match services
        .procurement
        .set_serialized(part_id, body.is_serialized, actor.user_id())
        .await
    {
        Ok(part) => (StatusCode::OK, Json(dto::part_to_json(&part))).into_response(),
        Err(e) => errors::operation_error_to_response(e),
    }
}

pub async fn deactivate_part(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(actor): Extension<ActorContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let part_id: PartId = match dto::parse_id(&id, "part") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match services.procurement.deactivate_part(part_id, actor.user_id()).await {
        Ok(part) => (StatusCode::OK, Json(dto::part_to_json(&part))).into_response(),
        Err(e) => errors::operation_error_to_response(e),
    }
}
