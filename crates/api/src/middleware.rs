use axum::{
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use fieldstock_core::UserId;

use crate::app::errors;
use crate::context::ActorContext;

/// Header carrying the acting user's id. Identity is asserted by the caller; it is not
/// authenticated here.
pub const ACTOR_HEADER: &str = "x-actor-id";

pub async fn actor_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, Response> {
    let actor = extract_actor(req.headers()).map_err(|message| {
        errors::json_error(StatusCode::UNAUTHORIZED, "unauthenticated", message)
    })?;

    req.extensions_mut().insert(ActorContext::new(actor));
    Ok(next.run(req).await)
}

fn extract_actor(headers: &HeaderMap) -> Result<UserId, &'static str> {
    let header = headers
        .get(ACTOR_HEADER)
        .ok_or("missing X-Actor-Id header")?;

    let header = header
        .to_str()
        .map_err(|_| "X-Actor-Id must be a UUID")?
        .trim();

    header.parse().map_err(|_| "X-Actor-Id must be a UUID")
}
