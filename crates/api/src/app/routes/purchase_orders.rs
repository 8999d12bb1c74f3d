use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch, post, put},
    Json, Router,
};

use fieldstock_core::TaxRate;
use fieldstock_infra::OperationResult;
use fieldstock_infra::procurement::{LineChanges, NewPurchaseOrder, OrderLineInput};
use fieldstock_purchasing::{PurchaseOrder, PurchaseOrderId};

use crate::app::{dto, errors};
use crate::app::services::AppServices;
use crate::context::ActorContext;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_purchase_orders).post(create_purchase_order))
        .route("/:id", get(get_purchase_order))
        .route("/:id/lines", post(add_line))
        .route("/:id/lines/:line_no", patch(update_line).delete(remove_line))
        .route("/:id/request-lines", post(add_request_lines))
        .route("/:id/charges", put(set_charges))
        .route("/:id/submit", post(submit))
        .route("/:id/approve", post(approve))
        .route("/:id/cancel", post(cancel))
        .route("/:id/receive", post(receive))
}

fn order_response(result: OperationResult<PurchaseOrder>, status: StatusCode) -> axum::response::Response {
    match result {
        Ok(order) => (status, Json(dto::order_to_json(&order))).into_response(),
        Err(e) => errors::operation_error_to_response(e),
    }
}

fn parse_order_id(id: &str) -> Result<PurchaseOrderId, axum::response::Response> {
    dto::parse_id(id, "purchase order")
}

pub async fn create_purchase_order(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(actor): Extension<ActorContext>,
    Json(body): Json<NewPurchaseOrder>,
) -> axum::response::Response {
    let result = services
        .procurement
        .create_purchase_order(body, actor.user_id())
        .await;
    order_response(result, StatusCode::CREATED)
}

pub async fn list_purchase_orders(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::PurchaseOrdersQuery>,
) -> axum::response::Response {
    let orders: Vec<_> = services
        .procurement
        .list_purchase_orders(query.status)
        .iter()
        .map(dto::order_to_json)
        .collect();
    (StatusCode::OK, Json(orders)).into_response()
}

pub async fn get_purchase_order(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let order_id = match parse_order_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    order_response(services.procurement.get_purchase_order(order_id), StatusCode::OK)
}

pub async fn add_line(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(actor): Extension<ActorContext>,
    Path(id): Path<String>,
    Json(body): Json<OrderLineInput>,
) -> axum::response::Response {
    let order_id = match parse_order_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let result = services.procurement.add_line(order_id, body, actor.user_id()).await;
    order_response(result, StatusCode::OK)
}

pub async fn update_line(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(actor): Extension<ActorContext>,
    Path((id, line_no)): Path<(String, u32)>,
    Json(body): Json<LineChanges>,
) -> axum::response::Response {
    let order_id = match parse_order_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let result = services
        .procurement
        .update_line(order_id, line_no, body, actor.user_id())
        .await;
    order_response(result, StatusCode::OK)
}

pub async fn remove_line(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(actor): Extension<ActorContext>,
    Path((id, line_no)): Path<(String, u32)>,
) -> axum::response::Response {
    let order_id = match parse_order_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let result = services
        .procurement
        .remove_line(order_id, line_no, actor.user_id())
        .await;
    order_response(result, StatusCode::OK)
}

pub async fn add_request_lines(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(actor): Extension<ActorContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::RequestLinesRequest>,
) -> axum::response::Response {
    let order_id = match parse_order_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let result = services
        .procurement
        .add_request_lines(order_id, body.request_id, actor.user_id())
        .await;
    order_response(result, StatusCode::OK)
}

pub async fn set_charges(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(actor): Extension<ActorContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::ChargesRequest>,
) -> axum::response::Response {
    let order_id = match parse_order_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let tax_rate = body.tax_rate_bp.map(TaxRate::from_basis_points);
    let result = services
        .procurement
        .set_charges(order_id, tax_rate, body.shipping, actor.user_id())
        .await;
    order_response(result, StatusCode::OK)
}

pub async fn submit(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(actor): Extension<ActorContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let order_id = match parse_order_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let result = services
        .procurement
        .submit_purchase_order(order_id, actor.user_id())
        .await;
    order_response(result, StatusCode::OK)
}

pub async fn approve(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(actor): Extension<ActorContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let order_id = match parse_order_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let result = services
        .procurement
        .approve_purchase_order(order_id, actor.user_id())
        .await;
    order_response(result, StatusCode::OK)
}

pub async fn cancel(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(actor): Extension<ActorContext>,
    Path(id): Path<String>,
    body: Option<Json<dto::ReasonRequest>>,
) -> axum::response::Response {
    let order_id = match parse_order_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let reason = body.map(|Json(b)| b).unwrap_or_default().reason;
    let result = services
        .procurement
        .cancel_purchase_order(order_id, reason, actor.user_id())
        .await;
    order_response(result, StatusCode::OK)
}

/// One receiving pass. Quantities beyond what is still outstanding are clamped and
/// reported per line.
pub async fn receive(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(actor): Extension<ActorContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::ReceiveRequest>,
) -> axum::response::Response {
    let order_id = match parse_order_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match services
        .procurement
        .receive_goods(order_id, body.lines, actor.user_id())
        .await
    {
        Ok(receipt) => (StatusCode::OK, Json(receipt)).into_response(),
        Err(e) => errors::operation_error_to_response(e),
    }
}
