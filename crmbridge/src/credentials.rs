//! OAuth client-credentials tokens for the downstream CRM.
//!
//! One token is shared by every worker. The cache refreshes under a single
//! async lock, so concurrent expiries produce exactly one token request, and
//! a token is treated as expired `token_margin` before its advertised
//! lifetime so in-flight calls do not race the real expiry.

use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use url::Url;

use conveyor::{HttpClient, HttpRequest, default_should_retry};

use crate::config::CrmConfig;
use crate::errors::{Error, Result};

/// Token endpoint response for the client-credentials grant.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    /// Advertised lifetime in seconds; absent with some CRM configurations
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// Caching token source for CRM API calls.
pub struct CredentialCache<C: HttpClient> {
    http: C,
    auth_url: Url,
    client_id: String,
    client_secret: String,
    api_timeout: Duration,
    margin: Duration,
    fallback_lifetime: Duration,
    cached: Mutex<Option<CachedToken>>,
}

impl<C: HttpClient> CredentialCache<C> {
    pub fn new(config: &CrmConfig, http: C) -> Self {
        Self {
            http,
            auth_url: config.auth_url.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            api_timeout: config.api_timeout,
            margin: config.token_margin,
            fallback_lifetime: config.token_fallback_lifetime,
            cached: Mutex::new(None),
        }
    }

    /// Current bearer token, refreshing when the cached one is stale.
    ///
    /// The lock is held across the refresh; concurrent callers wait for the
    /// one in-flight request instead of issuing their own.
    pub async fn token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.access_token.clone());
            }
        }

        let token = self.refresh().await?;
        let access_token = token.access_token.clone();
        *cached = Some(token);
        Ok(access_token)
    }

    /// Drop the cached token so the next `token()` call refreshes.
    ///
    /// Used when the CRM rejects a call with 401: the token was revoked
    /// server-side ahead of its advertised lifetime.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    async fn refresh(&self) -> Result<CachedToken> {
        let body = serde_urlencoded::to_string([
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ])
        .map_err(|e| Error::Internal {
            operation: format!("encode token request: {e}"),
        })?;

        let request = HttpRequest::new("POST", self.auth_url.as_str())
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body);

        let response = self
            .http
            .execute(&request, self.api_timeout.as_millis() as u64)
            .await
            .map_err(|e| Error::TransientFailure {
                message: format!("token endpoint unreachable: {e}"),
            })?;

        if default_should_retry(&response) {
            return Err(Error::TransientFailure {
                message: format!("token endpoint returned HTTP {}", response.status),
            });
        }
        if !response.is_success() {
            return Err(Error::AuthenticationFailure {
                message: format!("token endpoint returned HTTP {}", response.status),
            });
        }

        let parsed: TokenResponse =
            serde_json::from_str(&response.body).map_err(|e| Error::AuthenticationFailure {
                message: format!("unreadable token response: {e}"),
            })?;

        let lifetime = parsed
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(self.fallback_lifetime);
        let expires_at = Instant::now() + lifetime.saturating_sub(self.margin);

        tracing::debug!(lifetime_secs = lifetime.as_secs(), "Refreshed CRM access token");

        Ok(CachedToken {
            access_token: parsed.access_token,
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor::{HttpResponse, MockHttpClient};
    use std::sync::Arc;

    const TOKEN_KEY: &str = "POST http://localhost:9090/oauth/token";

    fn config() -> CrmConfig {
        CrmConfig {
            client_id: "id123".to_string(),
            client_secret: "s3cret".to_string(),
            token_margin: Duration::from_secs(300),
            token_fallback_lifetime: Duration::from_secs(600),
            ..CrmConfig::default()
        }
    }

    fn token_json(token: &str, expires_in: Option<u64>) -> String {
        match expires_in {
            Some(secs) => format!(r#"{{"access_token":"{token}","expires_in":{secs}}}"#),
            None => format!(r#"{{"access_token":"{token}"}}"#),
        }
    }

    fn ok(body: String) -> conveyor::Result<HttpResponse> {
        Ok(HttpResponse { status: 200, body })
    }

    #[tokio::test]
    async fn issues_one_request_and_caches() {
        let mock = MockHttpClient::new();
        mock.add_response(TOKEN_KEY, ok(token_json("tok_1", Some(3600))));

        let cache = CredentialCache::new(&config(), mock.clone());

        assert_eq!(cache.token().await.unwrap(), "tok_1");
        assert_eq!(cache.token().await.unwrap(), "tok_1");
        assert_eq!(mock.call_count_for(TOKEN_KEY), 1);
    }

    #[tokio::test]
    async fn form_body_carries_client_credentials() {
        let mock = MockHttpClient::new();
        mock.add_response(TOKEN_KEY, ok(token_json("tok_1", Some(3600))));

        let cache = CredentialCache::new(&config(), mock.clone());
        cache.token().await.unwrap();

        let calls = mock.get_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].body,
            "grant_type=client_credentials&client_id=id123&client_secret=s3cret"
        );
        assert!(calls[0].headers.contains(&(
            "Content-Type".to_string(),
            "application/x-www-form-urlencoded".to_string()
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn refreshes_once_margin_is_reached() {
        let mock = MockHttpClient::new();
        mock.add_response(TOKEN_KEY, ok(token_json("tok_1", Some(600))));
        mock.add_response(TOKEN_KEY, ok(token_json("tok_2", Some(600))));

        let cache = CredentialCache::new(&config(), mock.clone());
        assert_eq!(cache.token().await.unwrap(), "tok_1");

        // 600s lifetime with a 300s margin: stale at the 300s mark
        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(cache.token().await.unwrap(), "tok_1");
        assert_eq!(mock.call_count_for(TOKEN_KEY), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.token().await.unwrap(), "tok_2");
        assert_eq!(mock.call_count_for(TOKEN_KEY), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_lifetime_when_expiry_omitted() {
        let mock = MockHttpClient::new();
        mock.add_response(TOKEN_KEY, ok(token_json("tok_1", None)));
        mock.add_response(TOKEN_KEY, ok(token_json("tok_2", None)));

        // 600s fallback with a 300s margin behaves like an advertised 600s
        let cache = CredentialCache::new(&config(), mock.clone());
        assert_eq!(cache.token().await.unwrap(), "tok_1");

        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(cache.token().await.unwrap(), "tok_1");

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.token().await.unwrap(), "tok_2");
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let mock = MockHttpClient::new();
        mock.add_response(TOKEN_KEY, ok(token_json("tok_1", Some(3600))));

        let cache = Arc::new(CredentialCache::new(&config(), mock.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.token().await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "tok_1");
        }

        assert_eq!(mock.call_count_for(TOKEN_KEY), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_refresh() {
        let mock = MockHttpClient::new();
        mock.add_response(TOKEN_KEY, ok(token_json("tok_1", Some(3600))));
        mock.add_response(TOKEN_KEY, ok(token_json("tok_2", Some(3600))));

        let cache = CredentialCache::new(&config(), mock.clone());
        assert_eq!(cache.token().await.unwrap(), "tok_1");

        cache.invalidate().await;
        assert_eq!(cache.token().await.unwrap(), "tok_2");
        assert_eq!(mock.call_count_for(TOKEN_KEY), 2);
    }

    #[tokio::test]
    async fn rejected_client_is_an_auth_failure() {
        let mock = MockHttpClient::new();
        mock.add_response(
            TOKEN_KEY,
            Ok(HttpResponse {
                status: 401,
                body: r#"{"error":"invalid_client"}"#.to_string(),
            }),
        );

        let cache = CredentialCache::new(&config(), mock.clone());
        let err = cache.token().await.unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailure { .. }));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transient() {
        // No scripted response: the mock fails the call outright
        let mock = MockHttpClient::new();
        let cache = CredentialCache::new(&config(), mock.clone());

        let err = cache.token().await.unwrap_err();
        assert!(matches!(err, Error::TransientFailure { .. }));
    }

    #[tokio::test]
    async fn token_endpoint_outage_is_transient() {
        let mock = MockHttpClient::new();
        mock.add_response(
            TOKEN_KEY,
            Ok(HttpResponse {
                status: 503,
                body: String::new(),
            }),
        );

        let cache = CredentialCache::new(&config(), mock.clone());
        let err = cache.token().await.unwrap_err();
        assert!(matches!(err, Error::TransientFailure { .. }));
    }
}
