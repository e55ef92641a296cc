pub mod callback_service;
pub mod credentials;
pub mod mpesa_service;
pub mod stk_service;
