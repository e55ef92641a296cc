pub mod pool;
pub mod process_listener;
pub mod reconciler;
pub mod token_refresher;

pub use pool::BoundedPool;
pub use process_listener::ProcessListener;
pub use reconciler::{Reconciler, ReconcilerConfig};
pub use token_refresher::{RefreshBackoff, TokenRefreshConfig, TokenRefresher};
