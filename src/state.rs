use std::sync::Arc;

use crate::middleware::auth::AuthApi;
use crate::services::stk_service::StkService;

#[derive(Clone)]
pub struct AppState {
    pub stk: StkService,
    pub auth: Arc<AuthApi>,
}

impl AppState {
    pub fn new(stk: StkService) -> Self {
        let auth = stk.auth().clone();
        AppState { stk, auth }
    }
}
