//! Routes of the vault HTTP surface.
//!
//! - `GET    /healthz`, `GET /readyz`: probes
//! - `POST   /vault/{owner}/messages`: archive a deleted message
//! - `GET    /vault/{owner}/messages`: search (`subject`, `sender`, `recipient`, `limit`)
//! - `GET    /vault/{owner}/messages/{message_id}`: raw content
//! - `DELETE /vault/{owner}/messages/{message_id}`: forget a message
//! - `POST   /tasks/gc`: run garbage collection now

use crate::handlers::{
    AppState,
    health_handlers::{healthz, readyz},
    task_handlers::run_garbage_collection,
    vault_handlers::{append_message, delete_message, get_message_content, search_messages},
};
use axum::{
    Router,
    routing::{get, post},
};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/vault/{owner}/messages",
            post(append_message).get(search_messages),
        )
        .route(
            "/vault/{owner}/messages/{message_id}",
            get(get_message_content).delete(delete_message),
        )
        .route("/tasks/gc", post(run_garbage_collection))
}
