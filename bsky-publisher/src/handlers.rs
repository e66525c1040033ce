//! Axum handlers for the documents an OAuth client has to publish.

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};

use crate::error::Result;
use crate::service::PublishingService;

/// Routes for `/oauth-client-metadata.json` and `/oauth/jwks.json`
pub fn oauth_router(service: PublishingService) -> Router {
    Router::new()
        .route("/oauth-client-metadata.json", get(handle_client_metadata))
        .route("/oauth/jwks.json", get(handle_jwks))
        .with_state(service)
}

async fn handle_client_metadata(State(service): State<PublishingService>) -> Response {
    Json(service.config().client_metadata()).into_response()
}

async fn handle_jwks(State(service): State<PublishingService>) -> Result<Response> {
    let jwks = service.keys().jwks()?;
    Ok(Json(jwks).into_response())
}
