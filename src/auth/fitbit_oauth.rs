/// Fitbit OAuth2 authorization-code flow (server-side app, client secret + Basic auth)
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use tracing::{debug, warn};

use super::{TokenRecord, TokenResponse};
use crate::config::FitbitConfig;
use crate::error::{AuthError, AuthResult};

/// Token endpoint operations the lifecycle manager depends on
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OAuthClient: Send + Sync {
    /// Provider authorization page for the configured scopes
    fn authorization_url(&self, redirect_uri: &str) -> String;

    /// Exchange an authorization code for tokens
    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> AuthResult<TokenRecord>;

    /// Mint a new access token from the record's refresh token
    async fn refresh(&self, record: &TokenRecord) -> AuthResult<TokenRecord>;
}

/// How a token endpoint call went wrong, before exchange/refresh policy is applied
#[derive(Debug)]
enum EndpointFailure {
    Network(String),
    Rejected { status: u16, body: String },
    Malformed { status: u16, body: String },
}

impl EndpointFailure {
    /// Provider outages and rate limits are worth retrying
    fn is_retryable(&self) -> bool {
        match self {
            EndpointFailure::Network(_) => true,
            EndpointFailure::Rejected { status, .. } => *status >= 500 || *status == 429,
            EndpointFailure::Malformed { .. } => false,
        }
    }

    /// HTTP status (if the provider answered) and the body or transport error
    fn into_status_and_body(self) -> (Option<u16>, String) {
        match self {
            EndpointFailure::Network(message) => (None, message),
            EndpointFailure::Rejected { status, body } | EndpointFailure::Malformed { status, body } => {
                (Some(status), body)
            }
        }
    }
}

pub struct FitbitOAuth {
    client: reqwest::Client,
    client_id: String,
    client_secret: String,
    auth_url: String,
    token_url: String,
    scopes: Vec<String>,
}

impl FitbitOAuth {
    pub fn new(config: &FitbitConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .unwrap_or_else(|e| {
                warn!(
                    "Could not build HTTP client with {:?} timeout ({}), using defaults",
                    config.request_timeout(),
                    e
                );
                reqwest::Client::new()
            });

        Self {
            client,
            client_id: config.client_id.clone().unwrap_or_default(),
            client_secret: config.client_secret.clone().unwrap_or_default(),
            auth_url: config.auth_url.clone(),
            token_url: config.token_url.clone(),
            scopes: config.scopes.clone(),
        }
    }

    /// Build authorization URL
    pub fn build_authorization_url<S: AsRef<str>>(&self, redirect_uri: &str, scopes: &[S]) -> String {
        let scope = scopes
            .iter()
            .map(|s| s.as_ref())
            .collect::<Vec<_>>()
            .join(" ");

        format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&scope={}",
            self.auth_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(&scope),
        )
    }

    fn basic_auth(&self) -> String {
        let credentials = STANDARD.encode(format!("{}:{}", self.client_id, self.client_secret));
        format!("Basic {}", credentials)
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<TokenResponse, EndpointFailure> {
        let res = self
            .client
            .post(&self.token_url)
            .header("Authorization", self.basic_auth())
            .header("Accept", "application/json")
            .form(params)
            .send()
            .await
            .map_err(|e| EndpointFailure::Network(e.to_string()))?;

        let status = res.status();
        let body = res
            .text()
            .await
            .map_err(|e| EndpointFailure::Network(e.to_string()))?;

        if !status.is_success() {
            return Err(EndpointFailure::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body).map_err(|e| EndpointFailure::Malformed {
            status: status.as_u16(),
            body: format!("{}: {}", e, body),
        })
    }
}

#[async_trait]
impl OAuthClient for FitbitOAuth {
    fn authorization_url(&self, redirect_uri: &str) -> String {
        self.build_authorization_url(redirect_uri, self.scopes.as_slice())
    }

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> AuthResult<TokenRecord> {
        debug!("Exchanging authorization code");
        let params = [
            ("client_id", self.client_id.as_str()),
            ("grant_type", "authorization_code"),
            ("redirect_uri", redirect_uri),
            ("code", code),
        ];

        let response = match self.token_request(&params).await {
            Ok(response) => response,
            Err(failure) if failure.is_retryable() => {
                warn!("Token exchange hit a transient failure: {}", describe(&failure));
                return Err(AuthError::Transient(describe(&failure)));
            }
            Err(failure) => {
                let (status, body) = failure.into_status_and_body();
                return Err(AuthError::Exchange { status, body });
            }
        };

        TokenRecord::from_response(response, Utc::now()).ok_or_else(|| AuthError::Exchange {
            status: Some(200),
            body: "token response missing refresh_token".to_string(),
        })
    }

    async fn refresh(&self, record: &TokenRecord) -> AuthResult<TokenRecord> {
        debug!("Refreshing access token");
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", record.refresh_token.as_str()),
        ];

        match self.token_request(&params).await {
            Ok(response) => Ok(record.refreshed(response, Utc::now())),
            Err(failure) if failure.is_retryable() => Err(AuthError::Transient(describe(&failure))),
            Err(failure) => {
                let (status, body) = failure.into_status_and_body();
                Err(AuthError::Refresh { status, body })
            }
        }
    }
}

fn describe(failure: &EndpointFailure) -> String {
    match failure {
        EndpointFailure::Network(message) => message.clone(),
        EndpointFailure::Rejected { status, body } | EndpointFailure::Malformed { status, body } => {
            format!("HTTP {}: {}", status, body)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use mockito::Matcher;

    const TOKEN_BODY: &str = r#"{
        "access_token": "fresh-access",
        "expires_in": 28800,
        "refresh_token": "fresh-refresh",
        "scope": "weight sleep profile activity heartrate nutrition",
        "token_type": "Bearer",
        "user_id": "26FWFL"
    }"#;

    fn config(token_url: String) -> FitbitConfig {
        FitbitConfig {
            client_id: Some("23ABCD".to_string()),
            client_secret: Some("s3cret".to_string()),
            token_url,
            ..FitbitConfig::default()
        }
    }

    fn expired_record() -> TokenRecord {
        TokenRecord {
            access_token: "stale-access".to_string(),
            refresh_token: "old-refresh".to_string(),
            expires_in: 28800,
            expires_at: Utc::now() - Duration::hours(1),
            scope: Some("weight".to_string()),
            token_type: Some("Bearer".to_string()),
            user_id: Some("26FWFL".to_string()),
        }
    }

    fn expected_basic() -> String {
        format!("Basic {}", STANDARD.encode("23ABCD:s3cret"))
    }

    #[test]
    fn test_auth_url() {
        let oauth = FitbitOAuth::new(&FitbitConfig {
            client_id: Some("23ABCD".to_string()),
            ..FitbitConfig::default()
        });
        let url = oauth.authorization_url("http://localhost:3000/callback");

        assert!(url.starts_with("https://www.fitbit.com/oauth2/authorize?"));
        assert!(url.contains("response_type=code"));
        assert!(url.contains("client_id=23ABCD"));
        assert!(url.contains("redirect_uri=http%3A%2F%2Flocalhost%3A3000%2Fcallback"));

        let parsed = url::Url::parse(&url).unwrap();
        let scope = parsed
            .query_pairs()
            .find(|(k, _)| k == "scope")
            .map(|(_, v)| v.into_owned())
            .unwrap();
        let mut scopes: Vec<&str> = scope.split(' ').collect();
        scopes.sort_unstable();
        assert_eq!(scopes, vec!["activity", "heartrate", "nutrition", "profile", "sleep", "weight"]);
    }

    #[test]
    fn test_auth_url_is_pure() {
        let oauth = FitbitOAuth::new(&FitbitConfig::default());
        assert_eq!(
            oauth.build_authorization_url("http://localhost/cb", &["sleep"][..]),
            oauth.build_authorization_url("http://localhost/cb", &["sleep"][..]),
        );
    }

    #[tokio::test]
    async fn test_exchange_code_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth2/token")
            .match_header("authorization", expected_basic().as_str())
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
                Matcher::UrlEncoded("code".into(), "the-code".into()),
                Matcher::UrlEncoded("redirect_uri".into(), "http://localhost:3000/callback".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(TOKEN_BODY)
            .create_async()
            .await;

        let oauth = FitbitOAuth::new(&config(format!("{}/oauth2/token", server.url())));
        let before = Utc::now();
        let record = oauth
            .exchange_code("the-code", "http://localhost:3000/callback")
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(record.access_token, "fresh-access");
        assert_eq!(record.refresh_token, "fresh-refresh");
        assert_eq!(record.user_id.as_deref(), Some("26FWFL"));
        assert!(record.expires_at >= before + Duration::seconds(28800));
    }

    #[tokio::test]
    async fn test_exchange_code_rejected_carries_provider_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/oauth2/token")
            .with_status(400)
            .with_body(r#"{"errors":[{"errorType":"invalid_grant","message":"Authorization code expired"}],"success":false}"#)
            .create_async()
            .await;

        let oauth = FitbitOAuth::new(&config(format!("{}/oauth2/token", server.url())));
        let err = oauth.exchange_code("expired", "http://localhost:3000/callback").await.unwrap_err();

        match err {
            AuthError::Exchange { status, body } => {
                assert_eq!(status, Some(400));
                assert!(body.contains("invalid_grant"));
            }
            other => panic!("expected exchange error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exchange_without_refresh_token_fails() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/oauth2/token")
            .with_status(200)
            .with_body(r#"{"access_token":"a","expires_in":3600}"#)
            .create_async()
            .await;

        let oauth = FitbitOAuth::new(&config(format!("{}/oauth2/token", server.url())));
        let err = oauth.exchange_code("c", "http://localhost:3000/callback").await.unwrap_err();
        assert!(matches!(err, AuthError::Exchange { .. }));
    }

    #[tokio::test]
    async fn test_refresh_success_recomputes_expiry() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth2/token")
            .match_header("authorization", expected_basic().as_str())
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), "old-refresh".into()),
            ]))
            .with_status(200)
            .with_body(TOKEN_BODY)
            .create_async()
            .await;

        let oauth = FitbitOAuth::new(&config(format!("{}/oauth2/token", server.url())));
        let old = expired_record();
        let new = oauth.refresh(&old).await.unwrap();

        mock.assert_async().await;
        assert_eq!(new.access_token, "fresh-access");
        assert_eq!(new.refresh_token, "fresh-refresh");
        assert!(new.expires_at > old.expires_at);
        assert!(!new.is_expired());
    }

    #[tokio::test]
    async fn test_refresh_invalid_grant_is_terminal() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/oauth2/token")
            .with_status(401)
            .with_body(r#"{"errors":[{"errorType":"invalid_token","message":"Refresh token invalid"}]}"#)
            .create_async()
            .await;

        let oauth = FitbitOAuth::new(&config(format!("{}/oauth2/token", server.url())));
        let err = oauth.refresh(&expired_record()).await.unwrap_err();

        assert!(err.is_terminal());
        assert!(err.to_string().contains("invalid_token"));
    }

    #[tokio::test]
    async fn test_refresh_provider_outage_is_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/oauth2/token")
            .with_status(503)
            .with_body("Service Unavailable")
            .create_async()
            .await;

        let oauth = FitbitOAuth::new(&config(format!("{}/oauth2/token", server.url())));
        let err = oauth.refresh(&expired_record()).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_refresh_rate_limited_is_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/oauth2/token")
            .with_status(429)
            .create_async()
            .await;

        let oauth = FitbitOAuth::new(&config(format!("{}/oauth2/token", server.url())));
        assert!(oauth.refresh(&expired_record()).await.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_refresh_network_failure_is_transient() {
        // Nothing listens on port 1
        let oauth = FitbitOAuth::new(&config("http://127.0.0.1:1/oauth2/token".to_string()));
        let err = oauth.refresh(&expired_record()).await.unwrap_err();
        assert!(err.is_transient());

        let err = oauth.exchange_code("c", "http://localhost:3000/callback").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_request_timeout_is_applied() {
        // Accepts the connection and never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let token_url = format!("http://{}/oauth2/token", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        });

        let mut slow = config(token_url);
        slow.request_timeout_secs = 1;
        let oauth = FitbitOAuth::new(&slow);

        let started = std::time::Instant::now();
        let err = oauth.refresh(&expired_record()).await.unwrap_err();
        assert!(err.is_transient());
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_refresh_malformed_body_is_terminal() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/oauth2/token")
            .with_status(200)
            .with_body("<html>oops</html>")
            .create_async()
            .await;

        let oauth = FitbitOAuth::new(&config(format!("{}/oauth2/token", server.url())));
        assert!(oauth.refresh(&expired_record()).await.unwrap_err().is_terminal());
    }
}
