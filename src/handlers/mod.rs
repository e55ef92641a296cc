pub mod stk_handlers;
