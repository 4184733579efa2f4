pub mod deposit_handlers;
pub mod health_handlers;
