mod handlers;
pub mod router;
