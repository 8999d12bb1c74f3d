use axum::{routing::get, Router};

pub mod jobs;
pub mod locations;
pub mod parts;
pub mod purchase_orders;
pub mod requests;
pub mod stock;
pub mod system;
pub mod units;

/// Router for all endpoints that act on behalf of a user.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .route("/metrics/procurement", get(system::procurement_metrics))
        .nest("/parts", parts::router())
        .nest("/locations", locations::router())
        .nest("/requests", requests::router())
        .nest("/purchase-orders", purchase_orders::router())
        .nest("/stock", stock::router())
        .nest("/units", units::router())
        .route("/transfers", axum::routing::post(stock::transfer))
        .nest("/jobs", jobs::router())
        .route("/pickups", get(jobs::pickups))
}
