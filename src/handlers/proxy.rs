//! Catch-all handler: everything that is not a proxy endpoint goes to the backend

use axum::{extract::Request, extract::State, response::Response};

use crate::handlers::AppState;

pub async fn handler(State(state): State<AppState>, request: Request) -> Response {
    state.pipeline().handle(request).await
}
