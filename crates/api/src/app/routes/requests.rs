use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use fieldstock_infra::procurement::NewRequest;
use fieldstock_requests::RequestId;

use crate::app::{dto, errors};
use crate::app::services::AppServices;
use crate::context::ActorContext;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_requests).post(create_request))
        .route("/:id", get(get_request).delete(delete_request))
        .route("/:id/cancel", post(cancel_request))
}

pub async fn create_request(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(actor): Extension<ActorContext>,
    Json(body): Json<NewRequest>,
) -> axum::response::Response {
    match services.procurement.create_request(body, actor.user_id()).await {
        Ok(request) => (StatusCode::CREATED, Json(dto::request_to_json(&request))).into_response(),
        Err(e) => errors::operation_error_to_response(e),
    }
}

/// The procurement queue: `?filter=all|open|ordered`, most urgent first.
pub async fn list_requests(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::RequestsQuery>,
) -> axum::response::Response {
    (StatusCode::OK, Json(services.procurement.list_requests(query.filter))).into_response()
}

pub async fn get_request(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let request_id: RequestId = match dto::parse_id(&id, "request") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match services.procurement.get_request(request_id) {
        Ok(request) => (StatusCode::OK, Json(dto::request_to_json(&request))).into_response(),
        Err(e) => errors::operation_error_to_response(e),
    }
}

pub async fn cancel_request(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(actor): Extension<ActorContext>,
    Path(id): Path<String>,
    body: Option<Json<dto::ReasonRequest>>,
) -> axum::response::Response {
    let request_id: RequestId = match dto::parse_id(&id, "request") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let reason = body.map(|Json(b)| b).unwrap_or_default().reason;
    match services
        .procurement
        .cancel_request(request_id, reason, actor.user_id())
        .await
    {
        Ok(request) => (StatusCode::OK, Json(dto::request_to_json(&request))).into_response(),
        Err(e) => errors::operation_error_to_response(e),
    }
}

pub async fn delete_request(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(actor): Extension<ActorContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let request_id: RequestId = match dto::parse_id(&id, "request") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match services.procurement.delete_request(request_id, actor.user_id()).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => errors::operation_error_to_response(e),
    }
}
