pub mod admin;
mod health;
mod proxy;

pub use health::{health_check, readiness_check};
pub use proxy::forward;
