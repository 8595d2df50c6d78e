/// Token record shared by the store, the OAuth client and the manager
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_token: String,
    pub refresh_token: String,
    /// Seconds, as reported by the provider
    pub expires_in: u64,
    /// Derived from `expires_in` when the token was issued
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Token endpoint response body
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: u64, // 28800 seconds (8 hours)
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl TokenRecord {
    /// Build a record from a token response issued at `issued_at`.
    /// Returns `None` when the response carries no refresh token.
    pub fn from_response(response: TokenResponse, issued_at: DateTime<Utc>) -> Option<Self> {
        let refresh_token = response.refresh_token?;
        Some(Self {
            access_token: response.access_token,
            refresh_token,
            expires_in: response.expires_in,
            expires_at: expires_at(issued_at, response.expires_in),
            scope: response.scope,
            token_type: response.token_type,
            user_id: response.user_id,
        })
    }

    /// Successor record from a refresh response. Fields the provider omitted
    /// carry over from `self`; `expires_at` is always recomputed.
    pub fn refreshed(&self, response: TokenResponse, issued_at: DateTime<Utc>) -> Self {
        Self {
            access_token: response.access_token,
            refresh_token: response
                .refresh_token
                .unwrap_or_else(|| self.refresh_token.clone()),
            expires_in: response.expires_in,
            expires_at: expires_at(issued_at, response.expires_in),
            scope: response.scope.or_else(|| self.scope.clone()),
            token_type: response.token_type.or_else(|| self.token_type.clone()),
            user_id: response.user_id.or_else(|| self.user_id.clone()),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Negative once expired
    pub fn time_until_expiration(&self) -> Duration {
        self.expires_at - Utc::now()
    }
}

fn expires_at(issued_at: DateTime<Utc>, expires_in: u64) -> DateTime<Utc> {
    i64::try_from(expires_in)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|d| issued_at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(refresh: Option<&str>) -> TokenResponse {
        TokenResponse {
            access_token: "new-access".to_string(),
            expires_in: 28800,
            refresh_token: refresh.map(str::to_string),
            scope: None,
            token_type: Some("Bearer".to_string()),
            user_id: None,
        }
    }

    #[test]
    fn test_from_response_derives_expiry() {
        let issued = Utc::now();
        let record = TokenRecord::from_response(response(Some("r1")), issued).unwrap();

        assert_eq!(record.expires_at, issued + Duration::seconds(28800));
        assert_eq!(record.refresh_token, "r1");
        assert!(!record.is_expired_at(issued));
        assert!(record.is_expired_at(issued + Duration::seconds(28800)));
    }

    #[test]
    fn test_from_response_requires_refresh_token() {
        assert!(TokenRecord::from_response(response(None), Utc::now()).is_none());
    }

    #[test]
    fn test_refreshed_keeps_omitted_fields() {
        let issued = Utc::now() - Duration::hours(9);
        let mut old = TokenRecord::from_response(response(Some("old-refresh")), issued).unwrap();
        old.user_id = Some("ABC12".to_string());
        old.scope = Some("sleep weight".to_string());

        let now = Utc::now();
        let new = old.refreshed(response(None), now);

        assert_eq!(new.access_token, "new-access");
        assert_eq!(new.refresh_token, "old-refresh");
        assert_eq!(new.user_id.as_deref(), Some("ABC12"));
        assert_eq!(new.scope.as_deref(), Some("sleep weight"));
        assert_eq!(new.expires_at, now + Duration::seconds(28800));
    }

    #[test]
    fn test_deserialize_provider_response() {
        let body = r#"{
            "access_token": "eyJhbGciOi",
            "expires_in": 28800,
            "refresh_token": "c643a63c07",
            "scope": "weight sleep profile activity heartrate nutrition",
            "token_type": "Bearer",
            "user_id": "26FWFL"
        }"#;
        let parsed: TokenResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.user_id.as_deref(), Some("26FWFL"));
        assert_eq!(parsed.expires_in, 28800);
    }
}
