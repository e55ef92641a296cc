pub mod callback;
pub mod initiate;
pub mod list;
pub mod publish;
pub mod stk_transaction;

pub use callback::StkCallbackPayload;
pub use initiate::{GetStkTransactionRequest, InitiateStkRequest, InitiateStkResponse};
pub use list::{ListFilter, ListStkTransactionsRequest, ListStkTransactionsResponse, OrderField};
pub use publish::{
    ProcessStkTransactionRequest, ProcessedState, PublishInfo, PublishMessage,
    PublishStkTransactionRequest,
};
pub use stk_transaction::{StkStatus, StkTransaction};
