pub mod algorithms;
pub mod clock;
pub mod config;
pub mod config_validator;
pub mod database;
pub mod error;
pub mod governance;
pub mod handlers;
pub mod health;
pub mod lockout;
pub mod metrics;
pub mod middleware;
pub mod rate_limit_config;
pub mod rate_limiter;
pub mod response;
pub mod server;
pub mod users;
pub mod validation;

pub use config::Config;
pub use error::{Error, Result};
pub use governance::{Decision, DenyReason, RequestGovernor};
pub use response::ApiResponse;
pub use server::create_app;
