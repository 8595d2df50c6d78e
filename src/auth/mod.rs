// OAuth and token lifecycle modules

pub mod callback;
pub mod fitbit_oauth;
pub mod token;
pub mod token_manager;
pub mod token_store;

pub use callback::{AuthorizationFlow, CallbackOutcome, ListenerState};
pub use fitbit_oauth::{FitbitOAuth, OAuthClient};
pub use token::{TokenRecord, TokenResponse};
pub use token_manager::TokenManager;
pub use token_store::{FileTokenStore, TokenStore};
