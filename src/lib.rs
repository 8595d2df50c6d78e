pub mod auth;
pub mod config;
pub mod error;

// Re-export commonly used types
pub use auth::{AuthorizationFlow, CallbackOutcome, TokenManager, TokenRecord};
pub use config::Config;
pub use error::AuthError;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
