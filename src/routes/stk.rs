use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::handlers::stk_handlers;
use crate::middleware::auth::auth_middleware;
use crate::state::AppState;

pub fn stk_routes(state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/initiate", post(stk_handlers::initiate_stk_push))
        .route("/transactions/:id", get(stk_handlers::get_transaction))
        .route("/receipts/:receipt_id", get(stk_handlers::get_transaction_by_receipt))
        .route("/transactions/list", post(stk_handlers::list_transactions))
        // Admin only, checked against the token's group
        .route("/transactions/process", post(stk_handlers::process_transaction))
        .route("/transactions/publish", post(stk_handlers::publish_transaction))
        .route_layer(middleware::from_fn_with_state(state.auth.clone(), auth_middleware))
}
