/// Token lifecycle manager: load, validate, refresh and (re-)authorize
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::callback::{self, AuthorizationFlow, ListenerState};
use super::{FileTokenStore, FitbitOAuth, OAuthClient, TokenRecord, TokenStore};
use crate::config::{CallbackConfig, Config};
use crate::error::{AuthError, AuthResult};

pub struct TokenManager {
    oauth: Arc<dyn OAuthClient>,
    store: Arc<dyn TokenStore>,
    callback: CallbackConfig,
    has_credentials: bool,
    token: Mutex<Option<TokenRecord>>,
    listener: StdMutex<ListenerState>,
}

impl TokenManager {
    pub fn new(config: &Config, oauth: Arc<dyn OAuthClient>, store: Arc<dyn TokenStore>) -> Self {
        Self {
            oauth,
            store,
            callback: config.callback.clone(),
            has_credentials: config.fitbit.has_credentials(),
            token: Mutex::new(None),
            listener: StdMutex::new(ListenerState::Idle),
        }
    }

    /// Fitbit client + file store built from configuration
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config,
            Arc::new(FitbitOAuth::new(&config.fitbit)),
            Arc::new(FileTokenStore::new(&config.storage.token_path)),
        )
    }

    /// Load the persisted token and refresh it right away if it has expired
    pub async fn initialize(&self) {
        let Some(record) = self.store.load().await else {
            info!("No stored Fitbit token - authorization required");
            return;
        };

        let expired = record.is_expired();
        info!("Loaded stored Fitbit token (expires {})", record.expires_at);
        *self.token.lock().await = Some(record);

        if expired {
            info!("Stored token already expired, refreshing");
            if self.get_access_token().await.is_none() {
                warn!("Could not refresh stored token at startup");
            }
        }
    }

    /// Current access token, refreshing it first if expired.
    ///
    /// `None` means no usable token right now. After a terminal refresh
    /// failure the token is dropped and re-authorization is required; after a
    /// transient failure the expired token is kept so a later call can retry.
    pub async fn get_access_token(&self) -> Option<String> {
        let mut token = self.token.lock().await;
        let record = token.as_ref()?;

        if !record.is_expired() {
            return Some(record.access_token.clone());
        }

        info!("Access token expired at {}, refreshing", record.expires_at);

        let result = self.oauth.refresh(record).await;
        match result {
            Ok(refreshed) => {
                info!("✓ Access token refreshed (expires {})", refreshed.expires_at);
                let access_token = refreshed.access_token.clone();
                self.store.save(&refreshed).await;
                *token = Some(refreshed);
                Some(access_token)
            }
            Err(e) if e.is_transient() => {
                warn!("Token refresh failed, will retry on next request: {}", e);
                None
            }
            // Anything else means the refresh token is unusable
            Err(e) => {
                error!("Token refresh rejected, re-authorization required: {}", e);
                *token = None;
                None
            }
        }
    }

    /// Bind the callback listener and open the authorization page.
    ///
    /// Fails fast with `FlowInProgress` while another listener is active and
    /// with `Configuration` when client credentials are missing.
    pub async fn start_authorization_flow(self: &Arc<Self>) -> AuthResult<AuthorizationFlow> {
        {
            let mut state = self.lock_listener();
            if state.is_active() {
                info!("Authorization flow already running ({:?})", *state);
                return Err(AuthError::FlowInProgress);
            }
            if !self.has_credentials {
                warn!("Cannot start authorization: Fitbit client credentials not configured");
                return Err(AuthError::Configuration(
                    "set FITBIT_CLIENT_ID and FITBIT_CLIENT_SECRET".to_string(),
                ));
            }
            *state = ListenerState::Starting;
        }

        let authorization_url = self.oauth.authorization_url(&self.callback.redirect_uri());
        let flow = match callback::spawn(
            Arc::clone(self),
            &self.callback.bind_addr(),
            authorization_url,
            self.callback.timeout(),
        )
        .await
        {
            Ok(flow) => flow,
            Err(e) => {
                error!("{}", e);
                self.set_listener_state(ListenerState::Stopped);
                return Err(e);
            }
        };

        info!("🔐 Authorize at: {}", flow.authorization_url());
        if self.callback.open_browser {
            if let Err(e) = opener::open(flow.authorization_url()) {
                warn!("Could not open browser ({}), visit the URL above manually", e);
            }
        }

        Ok(flow)
    }

    /// Exchange an authorization code and adopt the resulting token
    pub(crate) async fn complete_authorization(&self, code: &str) -> AuthResult<()> {
        let record = self
            .oauth
            .exchange_code(code, &self.callback.redirect_uri())
            .await
            .inspect_err(|e| error!("Authorization code exchange failed: {}", e))?;

        info!(
            "✅ Authorized Fitbit user {} (expires {})",
            record.user_id.as_deref().unwrap_or("unknown"),
            record.expires_at
        );

        self.store.save(&record).await;
        *self.token.lock().await = Some(record);
        Ok(())
    }

    pub async fn has_token(&self) -> bool {
        self.token.lock().await.is_some()
    }

    pub async fn token_expires_at(&self) -> Option<DateTime<Utc>> {
        self.token.lock().await.as_ref().map(|t| t.expires_at)
    }

    pub fn listener_state(&self) -> ListenerState {
        *self.lock_listener()
    }

    pub(crate) fn set_listener_state(&self, state: ListenerState) {
        *self.lock_listener() = state;
    }

    fn lock_listener(&self) -> MutexGuard<'_, ListenerState> {
        self.listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
