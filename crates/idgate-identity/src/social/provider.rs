//! Generic OAuth2 authorization-code client.
//!
//! Posts the code to the provider's token endpoint, then reads the user
//! from its userinfo endpoint. Field names differ between providers and
//! come from [`ProfileFieldMap`].

use std::time::Duration;

use async_trait::async_trait;
use idgate_core::config::{OAuthProviderConfig, ProfileFieldMap};
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::Value;
use tracing::{instrument, warn};

use super::{ProviderProfile, SocialProvider};
use crate::error::{IdentityError, SocialProviderError};

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

pub struct OAuthProviderClient {
    name: String,
    config: OAuthProviderConfig,
    http: reqwest::Client,
}

impl OAuthProviderClient {
    /// Build a client whose every request is bounded by `timeout`.
    pub fn new(
        name: impl Into<String>,
        config: OAuthProviderConfig,
        timeout: Duration,
    ) -> Result<Self, IdentityError> {
        let name = name.into();
        if config.token_url.is_empty() || config.userinfo_url.is_empty() {
            return Err(IdentityError::Config(format!(
                "provider {name}: token_url and userinfo_url are required"
            )));
        }

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        // reqwest is built without a crypto provider; Err means one is already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(concat!("idgate/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| IdentityError::Config(format!("provider {name}: {e}")))?;

        Ok(Self { name, config, http })
    }

    async fn access_token(&self, code: &str) -> Result<String, SocialProviderError> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];
        let resp = self
            .http
            .post(&self.config.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| self.transport_failure("token", &e))?;
        let resp = self.check_status("token", resp)?;

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| self.transport_failure("token", &e))?;
        Ok(token.access_token)
    }

    async fn userinfo(&self, access_token: &str) -> Result<Value, SocialProviderError> {
        let resp = self
            .http
            .get(&self.config.userinfo_url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| self.transport_failure("userinfo", &e))?;
        let resp = self.check_status("userinfo", resp)?;

        resp.json()
            .await
            .map_err(|e| self.transport_failure("userinfo", &e))
    }

    /// Provider-side 5xx is worth retrying; 4xx means the code is bad.
    fn check_status(
        &self,
        endpoint: &str,
        resp: reqwest::Response,
    ) -> Result<reqwest::Response, SocialProviderError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        warn!(
            provider = %self.name,
            endpoint,
            status = status.as_u16(),
            "Provider rejected request"
        );
        Err(SocialProviderError::Exchange {
            retryable: status.is_server_error(),
        })
    }

    fn transport_failure(&self, endpoint: &str, err: &reqwest::Error) -> SocialProviderError {
        warn!(provider = %self.name, endpoint, error = %err, "Provider call failed");
        SocialProviderError::Exchange {
            retryable: !err.is_decode(),
        }
    }
}

#[async_trait]
impl SocialProvider for OAuthProviderClient {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, code), fields(provider = %self.name))]
    async fn exchange(&self, code: &str) -> Result<ProviderProfile, SocialProviderError> {
        let access_token = self.access_token(code).await?;
        let body = self.userinfo(&access_token).await?;

        let Some(mut profile) = map_profile(&body, &self.config.fields) else {
            warn!(provider = %self.name, "Userinfo response has no user id");
            return Err(SocialProviderError::Exchange { retryable: false });
        };
        profile.access_token = Some(access_token);
        Ok(profile)
    }
}

/// Read a userinfo document through the provider's field names. `None` if
/// the document carries no user id.
fn map_profile(body: &Value, fields: &ProfileFieldMap) -> Option<ProviderProfile> {
    let provider_user_id = text(body, &fields.id)?;
    Some(ProviderProfile {
        provider_user_id,
        email: text(body, &fields.email),
        email_verified: flag(body, &fields.email_verified),
        name: text(body, &fields.name),
        locale: text(body, &fields.locale),
        avatar_url: text(body, &fields.avatar_url),
        access_token: None,
    })
}

/// Non-empty string or number field.
fn text(body: &Value, field: &str) -> Option<String> {
    match body.get(field)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn flag(body: &Value, field: &str) -> bool {
    match body.get(field) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn maps_oidc_userinfo() {
        let body = json!({
            "sub": "1234",
            "email": "alice@example.com",
            "email_verified": true,
            "name": "Alice",
            "locale": "en",
            "picture": "https://img.example.com/a.png"
        });
        let profile = map_profile(&body, &ProfileFieldMap::default()).unwrap_or_default();
        assert_eq!(profile.provider_user_id, "1234");
        assert_eq!(profile.email.as_deref(), Some("alice@example.com"));
        assert!(profile.email_verified);
        assert_eq!(profile.avatar_url.as_deref(), Some("https://img.example.com/a.png"));
    }

    #[test]
    fn maps_custom_field_names_and_numeric_ids() {
        let fields = ProfileFieldMap {
            id: "id".into(),
            avatar_url: "avatar_url".into(),
            email_verified: "verified".into(),
            ..ProfileFieldMap::default()
        };
        let body = json!({
            "id": 583_231,
            "email": null,
            "verified": "TRUE",
            "name": "  ",
            "avatar_url": "https://avatars.example.com/u/583231"
        });
        let profile = map_profile(&body, &fields).unwrap_or_default();
        assert_eq!(profile.provider_user_id, "583231");
        assert_eq!(profile.email, None);
        assert!(profile.email_verified);
        assert_eq!(profile.name, None);
    }

    #[test]
    fn missing_id_is_rejected() {
        let body = json!({"email": "alice@example.com"});
        assert!(map_profile(&body, &ProfileFieldMap::default()).is_none());
    }

    #[test]
    fn empty_endpoints_are_a_config_error() {
        let config = OAuthProviderConfig {
            client_id: "id".into(),
            client_secret: "secret".into(),
            token_url: String::new(),
            userinfo_url: "https://example.com/userinfo".into(),
            redirect_uri: "https://app.example.com/cb".into(),
            fields: ProfileFieldMap::default(),
        };
        let result = OAuthProviderClient::new("acme", config, Duration::from_secs(1));
        assert!(matches!(result, Err(IdentityError::Config(_))));
    }
}
