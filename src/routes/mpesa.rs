use axum::{routing::post, Router};

use crate::handlers::stk_handlers;
use crate::state::AppState;

pub fn mpesa_routes() -> Router<AppState> {
    Router::new().route("/callback", post(stk_handlers::mpesa_callback))
}
